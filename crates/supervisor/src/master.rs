use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::worker::{Envelope, Loopback, Worker};

const WORKER_MAILBOX_CAPACITY: usize = 64;
const SUPERVISOR_MAILBOX_CAPACITY: usize = 1024;

enum Reply<W: Worker> {
    Oneshot(oneshot::Sender<Result<W::Response, SupervisorError<W::Error>>>),
    Shared(mpsc::Sender<Result<W::Response, SupervisorError<W::Error>>>),
    None,
}

/// Why a worker's mailbox loop ended. Carries only a stringified cause
/// (never the worker's own error type) because a single exit can have
/// several waiters (destroy callers, shutdown) and `W::Error` is never
/// required to be `Clone`.
enum WorkerExit {
    MailboxClosed,
    Cancelled,
    Inactive,
    Fatal(String),
}

enum Command<W: Worker> {
    Create {
        key: String,
        user_value: W::UserValue,
        reply: oneshot::Sender<Result<(), SupervisorError<W::Error>>>,
    },
    Destroy {
        key: String,
        reply: oneshot::Sender<Result<(), SupervisorError<W::Error>>>,
    },
    Exists {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Request {
        key: String,
        value: W::Request,
        reply: oneshot::Sender<Result<W::Response, SupervisorError<W::Error>>>,
    },
    Broadcast {
        value: W::Request,
        reply: oneshot::Sender<Vec<Result<W::Response, SupervisorError<W::Error>>>>,
    },
    Execute {
        value: W::Request,
        reply: oneshot::Sender<Result<W::Response, SupervisorError<W::Error>>>,
    },
    WorkerDone {
        key: String,
        exit: WorkerExit,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveWorker<W: Worker> {
    private_tx: mpsc::Sender<Envelope<W>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    Stopping,
}

/// Keyed worker supervisor (spec.md §4.1, the "Master").
///
/// All structural mutation (create/destroy/routing) happens on a single
/// internal event loop task; callers only ever talk to it over channels, so
/// no lock is needed around the worker map itself. `request`/`broadcast`/
/// `execute` dispatch is offloaded to short-lived forwarding tasks so one
/// slow or full worker mailbox can never stall the event loop.
pub struct Supervisor<W: Worker> {
    phase: Mutex<Phase>,
    cmd_tx: RwLock<Option<mpsc::Sender<Command<W>>>>,
    loop_join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<W: Worker> Default for Supervisor<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Worker> Supervisor<W> {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Stopped),
            cmd_tx: RwLock::new(None),
            loop_join: Mutex::new(None),
        }
    }

    /// `stopped -> started`.
    pub async fn start(&self) -> Result<(), SupervisorError<W::Error>> {
        let mut phase = self.phase.lock().await;
        if *phase != Phase::Stopped {
            return Err(SupervisorError::AlreadyStopped);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(SUPERVISOR_MAILBOX_CAPACITY);
        let done_tx = cmd_tx.clone();
        let join = tokio::spawn(event_loop::<W>(cmd_rx, done_tx));

        *self.cmd_tx.write().await = Some(cmd_tx);
        *self.loop_join.lock().await = Some(join);
        *phase = Phase::Started;
        Ok(())
    }

    /// `started -> stopping -> stopped`. Closes every worker's input
    /// channel, drains the done queue, then settles to `stopped`. A second
    /// call fails.
    pub async fn stop(&self) -> Result<(), SupervisorError<W::Error>> {
        let mut phase = self.phase.lock().await;
        if *phase != Phase::Started {
            return Err(SupervisorError::AlreadyStopped);
        }
        *phase = Phase::Stopping;

        let tx = self.cmd_tx.write().await.take();
        if let Some(tx) = tx {
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = tx.send(Command::Shutdown { reply: reply_tx }).await;
            drop(tx);
            let _ = reply_rx.await;
        }
        if let Some(join) = self.loop_join.lock().await.take() {
            let _ = join.await;
        }
        *phase = Phase::Stopped;
        Ok(())
    }

    async fn send_cmd(&self, cmd: Command<W>) -> Result<(), SupervisorError<W::Error>> {
        let guard = self.cmd_tx.read().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(cmd)
                .await
                .map_err(|_| SupervisorError::Stopped),
            None => Err(SupervisorError::Stopped),
        }
    }

    pub async fn create(
        &self,
        key: impl Into<String>,
        user_value: W::UserValue,
    ) -> Result<(), SupervisorError<W::Error>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::Create {
            key: key.into(),
            user_value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Cancelled)?
    }

    pub async fn destroy(&self, key: impl Into<String>) -> Result<(), SupervisorError<W::Error>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::Destroy {
            key: key.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Cancelled)?
    }

    pub async fn exists(&self, key: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send_cmd(Command::Exists {
                key: key.into(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn request(
        &self,
        key: impl Into<String>,
        value: W::Request,
    ) -> Result<W::Response, SupervisorError<W::Error>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::Request {
            key: key.into(),
            value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Cancelled)?
    }

    pub async fn broadcast(
        &self,
        value: W::Request,
    ) -> Vec<Result<W::Response, SupervisorError<W::Error>>>
    where
        W::Request: Clone,
    {
        let (reply, rx) = oneshot::channel();
        if self
            .send_cmd(Command::Broadcast { value, reply })
            .await
            .is_err()
        {
            return vec![Err(SupervisorError::Stopped)];
        }
        rx.await.unwrap_or_else(|_| vec![Err(SupervisorError::Cancelled)])
    }

    pub async fn execute(
        &self,
        value: W::Request,
    ) -> Result<W::Response, SupervisorError<W::Error>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Command::Execute { value, reply }).await?;
        rx.await.map_err(|_| SupervisorError::Cancelled)?
    }
}

async fn event_loop<W: Worker>(
    mut cmd_rx: mpsc::Receiver<Command<W>>,
    done_tx: mpsc::Sender<Command<W>>,
) {
    let mut active: HashMap<String, ActiveWorker<W>> = HashMap::new();
    let mut shutting_down: HashMap<String, Vec<oneshot::Sender<Result<(), SupervisorError<W::Error>>>>> =
        HashMap::new();

    // The any-worker queue (spec.md §4.1): one shared receiver every active
    // worker's task races to lock and drain from, so `execute` is answered
    // by whichever worker actually dequeues first rather than a fixed
    // rotation that can land on a busy worker while an idle one sits
    // unused.
    let (shared_tx, shared_rx) = mpsc::channel::<Envelope<W>>(SUPERVISOR_MAILBOX_CAPACITY);
    let shared_rx = Arc::new(Mutex::new(shared_rx));

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Create {
                key,
                user_value,
                reply,
            } => {
                if active.contains_key(&key) || shutting_down.contains_key(&key) {
                    let _ = reply.send(Err(SupervisorError::AlreadyExists));
                    continue;
                }

                let (private_tx, private_rx) = mpsc::channel(WORKER_MAILBOX_CAPACITY);
                let loopback = Loopback {
                    tx: private_tx.clone(),
                };
                match W::on_create(&key, user_value, loopback) {
                    Ok(worker) => {
                        let cancel = CancellationToken::new();
                        let max_inactivity = worker.max_inactivity();
                        active.insert(
                            key.clone(),
                            ActiveWorker {
                                private_tx,
                                cancel: cancel.clone(),
                            },
                        );
                        tokio::spawn(run_worker(
                            worker,
                            key,
                            private_rx,
                            shared_rx.clone(),
                            cancel,
                            max_inactivity,
                            done_tx.clone(),
                        ));
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SupervisorError::HandlerRejected(e)));
                    }
                }
            }
            Command::Destroy { key, reply } => {
                if let Some(worker) = active.remove(&key) {
                    worker.cancel.cancel();
                    shutting_down.entry(key).or_default().push(reply);
                } else if shutting_down.contains_key(&key) {
                    shutting_down.entry(key).or_default().push(reply);
                } else {
                    let _ = reply.send(Err(SupervisorError::NoSuchWorker));
                }
            }
            Command::Exists { key, reply } => {
                let _ = reply.send(active.contains_key(&key));
            }
            Command::Request { key, value, reply } => {
                let Some(worker) = active.get(&key) else {
                    let _ = reply.send(Err(SupervisorError::NoSuchWorker));
                    continue;
                };
                dispatch(worker.private_tx.clone(), value, Reply::Oneshot(reply));
            }
            Command::Broadcast { value, reply } => {
                if active.is_empty() {
                    let _ = reply.send(vec![Err(SupervisorError::EmptyFleet)]);
                    continue;
                }
                let (collect_tx, mut collect_rx) = mpsc::channel(active.len());
                for worker in active.values() {
                    dispatch(
                        worker.private_tx.clone(),
                        value.clone(),
                        Reply::Shared(collect_tx.clone()),
                    );
                }
                drop(collect_tx);
                tokio::spawn(async move {
                    let mut responses = Vec::new();
                    while let Some(resp) = collect_rx.recv().await {
                        responses.push(resp);
                    }
                    let _ = reply.send(responses);
                });
            }
            Command::Execute { value, reply } => {
                if active.is_empty() {
                    let _ = reply.send(Err(SupervisorError::EmptyFleet));
                    continue;
                }
                dispatch(shared_tx.clone(), value, Reply::Oneshot(reply));
            }
            Command::WorkerDone { key, exit } => {
                active.remove(&key);
                if let Some(waiters) = shutting_down.remove(&key) {
                    notify_waiters(waiters, &exit);
                }
            }
            Command::Shutdown { reply } => {
                for (key, worker) in active.drain() {
                    worker.cancel.cancel();
                    shutting_down.entry(key).or_default();
                }
                while !shutting_down.is_empty() {
                    match cmd_rx.recv().await {
                        Some(Command::WorkerDone { key, exit }) => {
                            if let Some(waiters) = shutting_down.remove(&key) {
                                notify_waiters(waiters, &exit);
                            }
                        }
                        Some(_) | None => {}
                    }
                }
                let _ = reply.send(());
                return;
            }
        }
    }
}

fn notify_waiters<E>(
    waiters: Vec<oneshot::Sender<Result<(), SupervisorError<E>>>>,
    exit: &WorkerExit,
) {
    for waiter in waiters {
        let result = match exit {
            WorkerExit::Fatal(msg) => Err(SupervisorError::WorkerExited(msg.clone())),
            WorkerExit::MailboxClosed | WorkerExit::Cancelled | WorkerExit::Inactive => Ok(()),
        };
        let _ = waiter.send(result);
    }
}

fn dispatch<W: Worker>(
    private_tx: mpsc::Sender<Envelope<W>>,
    value: W::Request,
    reply: Reply<W>,
) {
    tokio::spawn(async move {
        let envelope = Envelope {
            value,
            reply: match reply {
                Reply::Oneshot(tx) => crate::worker::ReplySlot::Oneshot(tx),
                Reply::Shared(tx) => crate::worker::ReplySlot::Shared(tx),
                Reply::None => crate::worker::ReplySlot::None,
            },
        };
        let _ = private_tx.send(envelope).await;
    });
}

async fn run_worker<W: Worker>(
    worker: W,
    key: String,
    mut rx: mpsc::Receiver<Envelope<W>>,
    shared_rx: Arc<Mutex<mpsc::Receiver<Envelope<W>>>>,
    cancel: CancellationToken,
    max_inactivity: Duration,
    done_tx: mpsc::Sender<Command<W>>,
) {
    let mut worker = worker;
    let exit = loop {
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => break WorkerExit::Cancelled,
            maybe = rx.recv() => match maybe {
                Some(envelope) => envelope,
                None => break WorkerExit::MailboxClosed,
            },
            // Locking only while waiting for the next shared-queue item
            // means the lock is released (and the item, if any, stays
            // queued — `recv` is cancel-safe) the instant this task wins
            // a private request or gets cancelled instead, so no worker
            // can hoard the any-worker queue while it has other work.
            maybe = async { shared_rx.lock().await.recv().await } => match maybe {
                Some(envelope) => envelope,
                None => break WorkerExit::MailboxClosed,
            },
            () = tokio::time::sleep(max_inactivity) => break WorkerExit::Inactive,
        };

        let crate::worker::Envelope { value, reply } = envelope;

        // Run the handler on its own task so a panic is caught at this task
        // boundary instead of taking down the worker's own loop silently.
        let handle_task = tokio::spawn(async move {
            let result = worker.handle(value).await;
            (worker, result)
        });

        match handle_task.await {
            Ok((returned_worker, Ok(response))) => {
                worker = returned_worker;
                deliver(reply, Ok(response));
            }
            Ok((returned_worker, Err(error))) => {
                let fatal = W::is_fatal(&error);
                let message = fatal.then(|| error.to_string());
                deliver(reply, Err(SupervisorError::HandlerError(error)));
                match message {
                    Some(message) => break WorkerExit::Fatal(message),
                    None => worker = returned_worker,
                }
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "panic in worker handler".to_string()
                } else {
                    join_err.to_string()
                };
                deliver(reply, Err(SupervisorError::Panicked(message.clone())));
                break WorkerExit::Fatal(message);
            }
        }
    };

    let _ = done_tx.send(Command::WorkerDone { key, exit }).await;
}

fn deliver<W: Worker>(
    reply: crate::worker::ReplySlot<W>,
    result: Result<W::Response, SupervisorError<W::Error>>,
) {
    match reply {
        crate::worker::ReplySlot::Oneshot(tx) => {
            let _ = tx.send(result);
        }
        crate::worker::ReplySlot::Shared(tx) => {
            let _ = tx.try_send(result);
        }
        crate::worker::ReplySlot::None => {}
    }
}
