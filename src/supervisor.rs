use std::collections::{btree_map, BTreeMap};
use std::{mem, thread};

use crate::thread_rt::{Builder, Task};
use crate::{Error, Result};

pub mod prelude {
    //! Supervisor prelude
    pub use super::Supervisor;
    pub use crate::thread_rt::{Builder, Scheduling};
}

/// A registry of named tasks spawned with [`Builder`]
pub struct Supervisor<T> {
    tasks: BTreeMap<String, Task<T>>,
}

impl<T> Default for Supervisor<T> {
    fn default() -> Self {
        Self {
            tasks: <_>::default(),
        }
    }
}

impl<T> Supervisor<T> {
    /// Creates an empty supervisor
    pub fn new() -> Self {
        Self::default()
    }
    /// Spawns a task from a [`Builder`] (or anything convertible into one)
    /// and registers it under its name, which must be unique within the
    /// supervisor
    pub fn spawn<F, B>(&mut self, builder: B, f: F) -> Result<&Task<T>>
    where
        B: Into<Builder>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let builder = builder.into();
        let Some(name) = builder.name.clone() else {
            return Err(Error::SupervisorNameNotSpecified);
        };
        let btree_map::Entry::Vacant(entry) = self.tasks.entry(name.clone()) else {
            return Err(Error::SupervisorDuplicateTask(name));
        };
        let task = builder.spawn(f)?;
        Ok(entry.insert(task))
    }
    /// Looks a task up by name
    pub fn get_task(&self, name: &str) -> Option<&Task<T>> {
        self.tasks.get(name)
    }
    /// Removes a task from the registry and hands it over to the caller
    pub fn take_task(&mut self, name: &str) -> Option<Task<T>> {
        self.tasks.remove(name)
    }
    /// Drops all finished tasks from the registry
    pub fn purge(&mut self) {
        self.tasks.retain(|_, task| !task.is_finished());
    }
    /// Joins every non-blocking task and clears the registry, returning the
    /// join results by task name
    pub fn join_all(&mut self) -> BTreeMap<String, thread::Result<T>> {
        let mut result = BTreeMap::new();
        for (name, task) in mem::take(&mut self.tasks) {
            if !task.is_blocking() {
                result.insert(name, task.join());
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::Supervisor;
    use crate::thread_rt::{set_simulated, Builder};
    use crate::Error;

    #[test]
    fn test_spawn_and_join() {
        set_simulated();
        let mut supervisor: Supervisor<u32> = Supervisor::new();
        supervisor.spawn("worker1", || 1).unwrap();
        supervisor.spawn(Builder::new().name("worker2"), || 2).unwrap();
        let err = supervisor.spawn("worker1", || 3).unwrap_err();
        assert!(matches!(err, Error::SupervisorDuplicateTask(_)));
        let results = supervisor.join_all();
        assert_eq!(results.len(), 2);
        assert_eq!(*results["worker1"].as_ref().unwrap(), 1);
        assert_eq!(*results["worker2"].as_ref().unwrap(), 2);
    }

    #[test]
    fn test_unnamed_task_rejected() {
        let mut supervisor: Supervisor<()> = Supervisor::new();
        let err = supervisor.spawn(Builder::new(), || ()).unwrap_err();
        assert!(matches!(err, Error::SupervisorNameNotSpecified));
    }
}
