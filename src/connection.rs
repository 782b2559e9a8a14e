//! One SQLite handle, one worker thread, one lock slot.
//!
//! ## Architecture
//!
//! A [`Connection`] owns a rusqlite handle that is opened on the caller's
//! thread and then *moved* into the worker closure. After that move there
//! is no way to reach the handle from outside the worker, which makes the
//! one-handle-one-thread rule a property of the type system instead of a
//! runtime convention.
//!
//! Work arrives as boxed closures over an unbounded channel and executes
//! strictly in enqueue order. Each task receives `Some(&mut handle)`
//! normally, or `None` when the connection is draining after a close
//! request, so every task gets the chance to resolve its own result
//! channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rusqlite::OpenFlags;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// A unit of work for the worker thread. `None` means the connection is
/// closing and the task must resolve its result channel without touching
/// the database.
pub(crate) type Task = Box<dyn FnOnce(Option<&mut rusqlite::Connection>) + Send + 'static>;

enum Message {
   Run(Task),
   Close,
}

/// Role of a connection within its pool, determining open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionRole {
   /// Read-write connection; creates the database file if missing.
   Write,
   /// Read-only connection.
   Read,
}

impl ConnectionRole {
   fn open_flags(self) -> OpenFlags {
      // FULLMUTEX even though only the worker uses the handle; it guards
      // accidental misuse, and URI keeps file: names working.
      let shared = OpenFlags::SQLITE_OPEN_FULL_MUTEX | OpenFlags::SQLITE_OPEN_URI;
      match self {
         ConnectionRole::Write => {
            shared | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
         }
         ConnectionRole::Read => shared | OpenFlags::SQLITE_OPEN_READ_ONLY,
      }
   }
}

/// A pooled SQLite connection with a dedicated worker thread and a
/// single-cell lock slot.
pub(crate) struct Connection {
   sender: Mutex<Option<Sender<Message>>>,
   worker: Mutex<Option<JoinHandle<()>>>,
   closing: Arc<AtomicBool>,
   lock: Mutex<Option<String>>,
   label: String,
}

impl Connection {
   /// Open the SQLite handle and start the worker.
   ///
   /// Open errors surface here, synchronously; everything after this point
   /// is reported through task result channels.
   pub fn open(
      path: &str,
      role: ConnectionRole,
      busy_timeout: Duration,
      label: String,
   ) -> Result<Self> {
      let handle = rusqlite::Connection::open_with_flags(path, role.open_flags())?;
      handle.busy_timeout(busy_timeout)?;

      let closing = Arc::new(AtomicBool::new(false));
      let (sender, receiver) = crossbeam_channel::unbounded();

      let worker = std::thread::Builder::new().name(label.clone()).spawn({
         let closing = Arc::clone(&closing);
         let label = label.clone();
         move || worker_loop(handle, receiver, closing, label)
      })?;

      debug!(connection = %label, ?role, "connection opened");

      Ok(Self {
         sender: Mutex::new(Some(sender)),
         worker: Mutex::new(Some(worker)),
         closing,
         lock: Mutex::new(None),
         label,
      })
   }

   /// Append a task to the work queue. Tasks execute one at a time, in
   /// FIFO order, on the worker thread.
   pub fn queue_work(&self, task: Task) -> Result<()> {
      match self.sender.lock().as_ref() {
         Some(sender) => sender
            .send(Message::Run(task))
            .map_err(|_| Error::DatabaseClosed),
         None => Err(Error::DatabaseClosed),
      }
   }

   /// Queue `job` and block until the worker has run it, returning its
   /// result. Fails with [`Error::DatabaseClosed`] if the connection
   /// closes before the job executes.
   pub fn run<T, F>(&self, job: F) -> Result<T>
   where
      T: Send + 'static,
      F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
   {
      let (sender, receiver) = crossbeam_channel::bounded(1);

      self.queue_work(Box::new(move |handle| {
         let result = match handle {
            Some(conn) => job(conn),
            None => Err(Error::DatabaseClosed),
         };
         let _ = sender.send(result);
      }))?;

      receiver.recv().map_err(|_| Error::DatabaseClosed)?
   }

   /// Bind `context_id` to this connection's lock slot.
   ///
   /// The pool only calls this with the slot empty.
   pub fn activate_lock(&self, context_id: &str) {
      let mut lock = self.lock.lock();
      debug_assert!(lock.is_none(), "lock slot already held");
      *lock = Some(context_id.to_owned());
   }

   /// True iff the lock slot currently holds `context_id`.
   pub fn matches_lock(&self, context_id: &str) -> bool {
      self.lock.lock().as_deref() == Some(context_id)
   }

   /// True iff no context holds this connection.
   pub fn lock_is_empty(&self) -> bool {
      self.lock.lock().is_none()
   }

   /// Empty the lock slot.
   pub fn clear_lock(&self) {
      *self.lock.lock() = None;
   }

   /// Shut the worker down and join it. Tasks still queued are drained and
   /// rejected; the worker closes the SQLite handle before exiting.
   /// Calling this more than once is a no-op.
   pub fn close(&self) {
      let sender = self.sender.lock().take();

      if let Some(sender) = sender {
         debug!(connection = %self.label, "closing connection");
         // Raise the flag before the sentinel so already-queued tasks are
         // rejected instead of run
         self.closing.store(true, Ordering::Release);
         let _ = sender.send(Message::Close);
      }

      let worker = self.worker.lock().take();
      if let Some(worker) = worker
         && worker.join().is_err()
      {
         warn!(connection = %self.label, "worker thread panicked");
      }
   }
}

impl Drop for Connection {
   fn drop(&mut self) {
      self.close();
   }
}

fn worker_loop(
   mut handle: rusqlite::Connection,
   receiver: Receiver<Message>,
   closing: Arc<AtomicBool>,
   label: String,
) {
   while let Ok(message) = receiver.recv() {
      match message {
         Message::Run(task) => {
            if closing.load(Ordering::Acquire) {
               task(None);
            } else {
               task(Some(&mut handle));
            }
         }
         Message::Close => break,
      }
   }

   // Anything that slipped in behind the close sentinel still gets a reject
   for message in receiver.try_iter() {
      if let Message::Run(task) = message {
         task(None);
      }
   }

   trace!(connection = %label, "worker exiting");
   if let Err((_, error)) = handle.close() {
      warn!(connection = %label, %error, "closing SQLite handle failed");
   }
}
