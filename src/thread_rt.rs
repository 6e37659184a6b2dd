use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static REALTIME_MODE: AtomicBool = AtomicBool::new(true);

/// The function can be used in test environments to disable real-time
/// functions but keep all methods running with no errors
pub fn set_simulated() {
    REALTIME_MODE.store(false, Ordering::Relaxed);
}

fn is_realtime() -> bool {
    REALTIME_MODE.load(Ordering::Relaxed)
}

fn errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Thread scheduling policy
///
/// See <https://man7.org/linux/man-pages/man7/sched.7.html>
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scheduling {
    #[serde(rename = "RR")]
    /// Round-robin
    RoundRobin,
    /// First in, first out
    FIFO,
    #[default]
    /// Other (the system default, non-real-time)
    Other,
}

impl From<Scheduling> for libc::c_int {
    fn from(value: Scheduling) -> Self {
        match value {
            Scheduling::RoundRobin => libc::SCHED_RR,
            Scheduling::FIFO => libc::SCHED_FIFO,
            Scheduling::Other => libc::SCHED_OTHER,
        }
    }
}

/// Scheduling policy, priority and CPU affinity of a runtime task
#[derive(Default, Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RTParams {
    scheduling: Scheduling,
    priority: Option<libc::c_int>,
    cpu_ids: Vec<usize>,
}

impl RTParams {
    /// Creates an empty parameters object (normal scheduling, no affinity)
    pub fn new() -> Self {
        Self::default()
    }
    /// Scheduling policy setter (build pattern). Choosing a real-time policy
    /// with no priority set defaults the priority to 1.
    pub fn set_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        if (scheduling == Scheduling::FIFO || scheduling == Scheduling::RoundRobin)
            && self.priority.is_none()
        {
            self.priority = Some(1);
        }
        self
    }
    /// Priority setter (build pattern)
    pub fn set_priority(mut self, priority: libc::c_int) -> Self {
        self.priority = Some(priority);
        self
    }
    /// CPU affinity setter (build pattern)
    pub fn set_cpu_ids(mut self, ids: &[usize]) -> Self {
        self.cpu_ids = ids.to_vec();
        self
    }
    /// The configured scheduling policy
    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }
    /// The configured priority
    pub fn priority(&self) -> Option<i32> {
        self.priority
    }
    /// The configured CPU affinity
    pub fn cpu_ids(&self) -> &[usize] {
        &self.cpu_ids
    }
}

/// Applies scheduling policy, priority and affinity to the thread with the
/// given kernel id (0 = the calling thread). Does nothing in simulated mode.
pub fn apply_thread_params(tid: libc::c_int, params: &RTParams) -> Result<()> {
    if !is_realtime() {
        return Ok(());
    }
    if !params.cpu_ids.is_empty() {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &id in &params.cpu_ids {
                libc::CPU_SET(id, &mut set);
            }
            if libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(Error::RTSchedSetAffinity(errno()));
            }
        }
    }
    let sp = libc::sched_param {
        sched_priority: params.priority.unwrap_or(0),
    };
    if unsafe { libc::sched_setscheduler(tid, params.scheduling.into(), &sp) } != 0 {
        return Err(Error::RTSchedSetScheduler(errno()));
    }
    Ok(())
}

/// Applies the parameters to the calling thread
pub fn enter_realtime(params: &RTParams) -> Result<()> {
    apply_thread_params(0, params)
}

/// Locks the process memory resident to avoid page faults. Does nothing in
/// simulated mode.
pub fn lock_memory() -> Result<()> {
    if !is_realtime() {
        return Ok(());
    }
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(Error::RTMemLock(errno()));
    }
    Ok(())
}

/// A [`thread::Builder`] counterpart which can also apply [`RTParams`] to the
/// spawned thread
#[derive(Default, Clone)]
pub struct Builder {
    pub(crate) name: Option<String>,
    stack_size: Option<usize>,
    blocking: bool,
    rt_params: RTParams,
}

macro_rules! impl_builder_from {
    ($t: ty) => {
        impl From<$t> for Builder {
            fn from(s: $t) -> Self {
                Builder::new().name(s)
            }
        }
    };
}

impl_builder_from!(&str);
impl_builder_from!(String);

impl Builder {
    /// Creates a new thread builder
    pub fn new() -> Self {
        Self::default()
    }
    /// Task name; keep it within 15 characters so the kernel thread name is
    /// not truncated
    pub fn name<N: fmt::Display>(mut self, name: N) -> Self {
        self.name = Some(name.to_string());
        self
    }
    /// Overrides the default stack size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
    /// Marks the task as one which never returns (socket listener etc), so
    /// supervisors skip it when joining
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
    /// Real-time parameters to apply to the spawned thread
    ///
    /// See [`RTParams`]
    pub fn rt_params(mut self, rt_params: RTParams) -> Self {
        self.rt_params = rt_params;
        self
    }
    /// Spawns a task.
    ///
    /// # Errors
    ///
    /// Fails when real-time parameters were requested but could not be
    /// applied; the spawned thread panics in that case instead of running its
    /// payload.
    pub fn spawn<F, T>(self, f: F) -> Result<Task<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(ref name) = self.name {
            if name.len() > 15 {
                return Err(Error::invalid_data(format!(
                    "thread name `{}` does not fit 15 characters",
                    name
                )));
            }
            builder = builder.name(name.clone());
        }
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let (tx, rx) = oneshot::channel();
        let handle = builder.spawn(move || {
            report_tid_and_hold(tx);
            f()
        })?;
        let tid = setup_spawned_thread(rx, &self.rt_params)?;
        Ok(Task {
            name: self.name.unwrap_or_default(),
            handle,
            blocking: self.blocking,
            tid,
            rt_params: self.rt_params,
        })
    }
}

/// A spawned task, returned by [`Builder::spawn()`]
///
/// Can be converted into a standard [`JoinHandle`].
#[derive(Debug)]
pub struct Task<T> {
    name: String,
    handle: JoinHandle<T>,
    blocking: bool,
    tid: libc::c_int,
    rt_params: RTParams,
}

impl<T> Task<T> {
    /// The task name
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The underlying join handle
    pub fn handle(&self) -> &JoinHandle<T> {
        &self.handle
    }
    /// The real-time params the task currently runs with
    pub fn rt_params(&self) -> &RTParams {
        &self.rt_params
    }
    /// Re-schedules the running task; on failure the previous parameters are
    /// restored
    pub fn apply_rt_params(&mut self, rt_params: RTParams) -> Result<()> {
        if let Err(e) = apply_thread_params(self.tid, &rt_params) {
            let _r = apply_thread_params(self.tid, &self.rt_params);
            return Err(e);
        }
        self.rt_params = rt_params;
        Ok(())
    }
    /// True if the task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
    /// Joins the task
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
    /// True if the task was spawned as blocking
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
}

impl<T> From<Task<T>> for JoinHandle<T> {
    fn from(task: Task<T>) -> Self {
        task.handle
    }
}

// Runs inside the spawned thread: reports the kernel tid to the spawner and
// holds until the spawner has applied the scheduling parameters.
fn report_tid_and_hold(tx_tid: oneshot::Sender<(libc::c_int, oneshot::Sender<bool>)>) {
    let tid = unsafe { i32::try_from(libc::syscall(libc::SYS_gettid)).unwrap_or(-200) };
    let (tx_ok, rx_ok) = oneshot::channel::<bool>();
    tx_tid.send((tid, tx_ok)).unwrap();
    if !rx_ok.recv().unwrap() {
        panic!(
            "thread setup failed for `{}`",
            thread::current().name().unwrap_or_default()
        );
    }
}

// Runs on the spawner side: waits for the tid, applies the parameters and
// acks the spawned thread either way.
fn setup_spawned_thread(
    rx_tid: oneshot::Receiver<(libc::c_int, oneshot::Sender<bool>)>,
    params: &RTParams,
) -> Result<libc::c_int> {
    let (tid, tx_ok) = rx_tid.recv()?;
    if tid < 0 {
        tx_ok.send(false).map_err(|e| Error::Comm(e.to_string()))?;
        return Err(Error::RTGetTId(tid));
    }
    if let Err(e) = apply_thread_params(tid, params) {
        tx_ok.send(false).map_err(|e| Error::Comm(e.to_string()))?;
        return Err(e);
    }
    tx_ok.send(true).map_err(|e| Error::Comm(e.to_string()))?;
    Ok(tid)
}
