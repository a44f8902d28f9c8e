//! Command queue actor and its handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Command, CommandError, CommandExecutor, CommandOutcome};
use crate::clock::{self, Clock};
use crate::config::CommandConfig;

type Responder = oneshot::Sender<Result<CommandOutcome, CommandError>>;

/// A command waiting in the queue.
#[derive(Debug)]
struct QueuedCommand {
    command: Command,
    enqueued_at: DateTime<Utc>,
    timeout: Duration,
    /// Clear epoch at enqueue time; older epochs are dropped unexecuted
    epoch: u64,
    responder: Responder,
}

/// Spawns the queue actor driving `executor` and returns its handle.
///
/// Commands run strictly in enqueue order, one at a time, each raced
/// against its own timeout on `clock`.
pub fn spawn_command_queue<E>(executor: E, clock: Arc<dyn Clock>, config: CommandConfig) -> CommandQueue
where
    E: CommandExecutor,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let epoch = Arc::new(AtomicU64::new(0));
    let shutdown = CancellationToken::new();

    tokio::spawn(run_actor_loop(
        executor,
        receiver,
        Arc::clone(&epoch),
        Arc::clone(&clock),
        shutdown.clone(),
    ));

    CommandQueue {
        sender,
        epoch,
        clock,
        default_timeout: config.default_timeout,
        shutdown,
    }
}

/// Handle for submitting commands to the queue actor.
///
/// Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: mpsc::UnboundedSender<QueuedCommand>,
    epoch: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    shutdown: CancellationToken,
}

/// A submitted command whose result has not been awaited yet.
#[derive(Debug)]
pub struct PendingCommand {
    receiver: oneshot::Receiver<Result<CommandOutcome, CommandError>>,
}

impl PendingCommand {
    /// Waits for the command to settle.
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::enqueue`].
    pub async fn outcome(self) -> Result<CommandOutcome, CommandError> {
        self.receiver.await.map_err(|_| CommandError::QueueClosed)?
    }
}

impl CommandQueue {
    /// Appends `command` to the tail and waits for its outcome.
    ///
    /// # Errors
    ///
    /// - `CommandError::Timeout` - The command ran longer than `timeout`
    /// - `CommandError::Cleared` - `clear` ran before the command started
    /// - `CommandError::QueueClosed` - The queue was shut down
    /// - `CommandError::Session` - The command itself failed
    pub async fn enqueue(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandOutcome, CommandError> {
        self.submit(command, timeout)?.outcome().await
    }

    /// Enqueues with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](Self::enqueue).
    pub async fn enqueue_default(&self, command: Command) -> Result<CommandOutcome, CommandError> {
        self.enqueue(command, self.default_timeout).await
    }

    /// Appends `command` without waiting; its queue position is fixed on return.
    ///
    /// # Errors
    ///
    /// - `CommandError::QueueClosed` - The queue was shut down
    pub fn submit(&self, command: Command, timeout: Duration) -> Result<PendingCommand, CommandError> {
        if self.shutdown.is_cancelled() {
            return Err(CommandError::QueueClosed);
        }

        let (responder, receiver) = oneshot::channel();
        let queued = QueuedCommand {
            command,
            enqueued_at: self.clock.now(),
            timeout,
            epoch: self.epoch.load(Ordering::SeqCst),
            responder,
        };
        self.sender
            .send(queued)
            .map_err(|_| CommandError::QueueClosed)?;

        Ok(PendingCommand { receiver })
    }

    /// Drops every command that has not started; the running one continues.
    pub fn clear(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Command queue cleared (epoch {})", epoch);
    }

    /// Stops the actor. The running command is abandoned and later calls
    /// return `QueueClosed`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_actor_loop<E>(
    mut executor: E,
    mut receiver: mpsc::UnboundedReceiver<QueuedCommand>,
    epoch: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) where
    E: CommandExecutor,
{
    tracing::debug!("Command queue actor started");

    loop {
        let queued = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            queued = receiver.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        if queued.epoch < epoch.load(Ordering::SeqCst) {
            tracing::debug!("Dropping cleared {} command", queued.command.kind());
            let _ = queued.responder.send(Err(CommandError::Cleared));
            continue;
        }

        let QueuedCommand {
            command,
            enqueued_at,
            timeout,
            responder,
            ..
        } = queued;
        let kind = command.kind();
        let waited = clock.now() - enqueued_at;
        tracing::debug!(
            "Running {} command after {}ms in queue",
            kind,
            waited.num_milliseconds()
        );

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                let _ = responder.send(Err(CommandError::QueueClosed));
                break;
            }
            result = clock::timeout(clock.as_ref(), timeout, executor.execute(command)) => result,
        };

        let result = match result {
            Some(result) => result.map_err(CommandError::from),
            None => {
                tracing::warn!("{} command timed out after {:?}", kind, timeout);
                Err(CommandError::Timeout { kind, timeout })
            }
        };
        let _ = responder.send(result);
    }

    // Fail everything still queued
    receiver.close();
    while let Ok(queued) = receiver.try_recv() {
        let _ = queued.responder.send(Err(CommandError::QueueClosed));
    }

    tracing::debug!("Command queue actor stopped");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::SystemClock;
    use crate::command::{CommandKind, LoadTarget};
    use crate::session::SessionError;

    /// Executor logging start and end of each command; seeks take 100ms
    /// and loads of "slow" never finish.
    #[derive(Debug, Clone, Default)]
    struct ScriptedExecutor {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&mut self, command: Command) -> Result<CommandOutcome, SessionError> {
            self.log.lock().push(format!("start {}", command.kind()));
            let outcome = match command {
                Command::Load(LoadTarget::Cid(raw)) if raw == "slow" => {
                    std::future::pending::<CommandOutcome>().await
                }
                Command::Load(_) => return Err(SessionError::RotationEmpty),
                Command::Seek { position } => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    CommandOutcome::Seeked { position }
                }
                Command::Play => CommandOutcome::Playing,
                Command::Pause => CommandOutcome::Paused,
            };
            self.log.lock().push(format!("end {}", command_name(&outcome)));
            Ok(outcome)
        }
    }

    fn command_name(outcome: &CommandOutcome) -> &'static str {
        match outcome {
            CommandOutcome::Seeked { .. } => "seek",
            CommandOutcome::Playing => "play",
            CommandOutcome::Paused => "pause",
            _ => "other",
        }
    }

    fn spawn(executor: ScriptedExecutor) -> CommandQueue {
        spawn_command_queue(executor, Arc::new(SystemClock), CommandConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_run_one_at_a_time_in_order() {
        let executor = ScriptedExecutor::default();
        let log = Arc::clone(&executor.log);
        let queue = spawn(executor);

        let seek = queue
            .submit(Command::Seek { position: 5 }, Duration::from_secs(1))
            .unwrap();
        let play = queue.submit(Command::Play, Duration::from_secs(1)).unwrap();
        let pause = queue.submit(Command::Pause, Duration::from_secs(1)).unwrap();

        assert_eq!(pause.outcome().await, Ok(CommandOutcome::Paused));
        assert_eq!(play.outcome().await, Ok(CommandOutcome::Playing));
        assert_eq!(
            seek.outcome().await,
            Ok(CommandOutcome::Seeked { position: 5 })
        );
        assert_eq!(
            *log.lock(),
            vec![
                "start seek",
                "end seek",
                "start play",
                "end play",
                "start pause",
                "end pause"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_stall_queue() {
        let queue = spawn(ScriptedExecutor::default());

        let slow = queue
            .submit(
                Command::Load(LoadTarget::Cid("slow".to_string())),
                Duration::from_millis(50),
            )
            .unwrap();
        let play = queue.submit(Command::Play, Duration::from_secs(1)).unwrap();

        assert_eq!(
            slow.outcome().await,
            Err(CommandError::Timeout {
                kind: CommandKind::Load,
                timeout: Duration::from_millis(50)
            })
        );
        assert_eq!(play.outcome().await, Ok(CommandOutcome::Playing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_errors_are_surfaced() {
        let queue = spawn(ScriptedExecutor::default());
        let result = queue
            .enqueue(Command::Load(LoadTarget::Next), Duration::from_secs(1))
            .await;
        assert_eq!(
            result,
            Err(CommandError::Session(SessionError::RotationEmpty))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_waiting_commands_only() {
        let executor = ScriptedExecutor::default();
        let log = Arc::clone(&executor.log);
        let queue = spawn(executor);

        let seek = queue
            .submit(Command::Seek { position: 1 }, Duration::from_secs(1))
            .unwrap();
        // Let the seek start
        tokio::task::yield_now().await;
        let play = queue.submit(Command::Play, Duration::from_secs(1)).unwrap();
        queue.clear();
        let pause = queue.submit(Command::Pause, Duration::from_secs(1)).unwrap();

        assert_eq!(
            seek.outcome().await,
            Ok(CommandOutcome::Seeked { position: 1 })
        );
        assert_eq!(play.outcome().await, Err(CommandError::Cleared));
        assert_eq!(pause.outcome().await, Ok(CommandOutcome::Paused));
        assert!(!log.lock().contains(&"start play".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_queue() {
        let queue = spawn(ScriptedExecutor::default());
        let slow = queue
            .submit(
                Command::Load(LoadTarget::Cid("slow".to_string())),
                Duration::from_secs(60),
            )
            .unwrap();
        tokio::task::yield_now().await;

        queue.shutdown();

        assert_eq!(slow.outcome().await, Err(CommandError::QueueClosed));
        assert_eq!(
            queue.enqueue_default(Command::Play).await,
            Err(CommandError::QueueClosed)
        );
    }
}
