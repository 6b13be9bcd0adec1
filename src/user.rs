//! Virtual users and the scheduler that launches them.
//!
//! Each virtual user owns one [`SessionState`] and replays the scripted actions for the
//! configured number of iterations. An iteration starts by resetting the session to only
//! its `UID` and merging in the next feeder record, if a feeder is configured. Every
//! action is then submitted to the worker pool as a [`Task`], and the user waits for the
//! session to be handed back before submitting the next one.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::action::Action;
use crate::feeder::FeederHandle;
use crate::session::SessionState;
use crate::util;
use crate::worker::{CompletionBarrier, Task};

/// Generated user identifiers start after this value.
pub const UID_BASE: usize = 10_000;

/// Everything virtual users share.
pub struct UserContext {
    /// How many times each user replays the actions.
    pub iterations: usize,
    /// How long each user pauses between iterations.
    pub pacing: Duration,
    pub actions: Vec<Arc<Action>>,
    /// Queue of the worker pool.
    pub tasks: flume::Sender<Task>,
    pub feeder: Option<FeederHandle>,
    pub barrier: CompletionBarrier,
}

/// The `UID` of virtual user `user`, unique within a load test.
pub fn uid(user: usize) -> String {
    (UID_BASE + user).to_string()
}

/// Launch `users` virtual users, `stagger` apart, and wait until they have all finished
/// and every task they submitted has completed.
pub async fn launch_users(users: usize, stagger: Duration, context: Arc<UserContext>) {
    let mut handles = Vec::with_capacity(users);
    let mut drift_timer = tokio::time::Instant::now();
    for user in 1..=users {
        handles.push(tokio::spawn(user_main(user, context.clone())));
        debug!("launched user {} of {}", user, users);
        if user < users && !stagger.is_zero() {
            drift_timer = util::sleep_minus_drift(stagger, drift_timer).await;
        }
    }
    info!("launched {} users", users);

    for result in join_all(handles).await {
        if let Err(e) = result {
            warn!("user failed to exit cleanly: {}", e);
        }
    }
    context.barrier.wait().await;
}

/// Run all iterations of one virtual user.
pub async fn user_main(user: usize, context: Arc<UserContext>) {
    let mut session = SessionState::new(&uid(user));
    debug!("user {} starting with UID {}", user, uid(user));

    for iteration in 1..=context.iterations {
        session.reset();
        if let Some(feeder) = context.feeder.as_ref() {
            match feeder.next().await {
                Some(record) => session.merge(&record),
                None => warn!("user {}: feeder closed, continuing without data", user),
            }
        }

        for action in &context.actions {
            let (reply, reply_receiver) = flume::bounded(1);
            let task = Task {
                action: action.clone(),
                session,
                user,
                iteration,
                reply,
                completion: context.barrier.register(),
            };
            if context.tasks.send_async(task).await.is_err() {
                debug!("user {}: task queue closed, exiting", user);
                return;
            }
            session = match reply_receiver.recv_async().await {
                Ok(session) => session,
                Err(_) => {
                    // The task failed fatally, the load test is stopping.
                    debug!("user {}: session not returned, exiting", user);
                    return;
                }
            };
        }

        if iteration < context.iterations && !context.pacing.is_zero() {
            tokio::time::sleep(context.pacing).await;
        }
    }
    debug!("user {} finished {} iterations", user, context.iterations);
}
