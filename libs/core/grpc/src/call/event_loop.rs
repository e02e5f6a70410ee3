use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
  name: String,
  job: Job,
}

/// Single thread on which every callback of one call manager runs.
///
/// Jobs run one at a time in the order they were posted. A job that panics is
/// logged and the loop carries on with the next one. The thread exits once
/// every handle to the loop has been dropped and the queue is drained.
#[derive(Clone)]
pub struct EventLoop {
  sender: mpsc::UnboundedSender<Task>,
  thread_name: Arc<str>,
}

impl EventLoop {
  pub fn start(thread_name: impl Into<String>) -> std::io::Result<Self> {
    let thread_name: String = thread_name.into();
    let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

    std::thread::Builder::new()
      .name(thread_name.clone())
      .spawn(move || {
        while let Some(task) = receiver.blocking_recv() {
          tracing::trace!(target: "grpc_client", handler = %task.name, "Running handler");
          if catch_unwind(AssertUnwindSafe(task.job)).is_err() {
            tracing::error!(target: "grpc_client", handler = %task.name, "Handler panicked");
          }
        }
        tracing::debug!(target: "grpc_client", "Event loop stopped");
      })?;

    Ok(Self {
      sender,
      thread_name: Arc::from(thread_name),
    })
  }

  /// Queue `job` behind everything already posted. Returns false if the loop
  /// thread is gone, in which case the job is dropped unrun.
  pub fn post(&self, name: impl Into<String>, job: impl FnOnce() + Send + 'static) -> bool {
    let task = Task {
      name: name.into(),
      job: Box::new(job),
    };
    match self.sender.send(task) {
      Ok(()) => true,
      Err(mpsc::error::SendError(task)) => {
        tracing::warn!(target: "grpc_client", handler = %task.name, "Event loop stopped, dropping handler");
        false
      }
    }
  }

  pub fn thread_name(&self) -> &str {
    &self.thread_name
  }

  /// Whether the current thread is this loop's thread
  pub fn is_current(&self) -> bool {
    std::thread::current().name() == Some(&*self.thread_name)
  }
}

impl std::fmt::Debug for EventLoop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventLoop")
      .field("thread_name", &self.thread_name)
      .finish()
  }
}
