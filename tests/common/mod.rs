//! Shared test fixtures: an in-process container engine fake.

// Each test binary uses a different subset of the fake's surface.
#![allow(dead_code)]

use async_trait::async_trait;
use clowdy::engine::{
    BuildContext, ContainerEngine, ContainerLogs, ContainerSpec, WaitOutcome,
};
use clowdy::error::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted container run.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub wait: WaitOutcome,
    pub stdout: String,
    pub stderr: String,
}

impl PlannedRun {
    /// A run that prints one JSON line and exits 0.
    pub fn success(stdout_line: &str) -> Self {
        Self {
            wait: WaitOutcome::Exited(0),
            stdout: format!("{stdout_line}\n"),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i64, stderr: &str) -> Self {
        Self {
            wait: WaitOutcome::Exited(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            wait: WaitOutcome::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    planned: VecDeque<PlannedRun>,
    assigned: HashMap<String, PlannedRun>,
    created: Vec<ContainerSpec>,
    archives: Vec<(String, String)>,
    builds: Vec<(String, Vec<String>)>,
    images: HashSet<String>,
    removed: Vec<String>,
    build_error: Option<String>,
    refuse_create: bool,
    next_id: usize,
}

/// Scriptable in-process [`ContainerEngine`].
///
/// Records every call so tests can assert on the exact specs, archives,
/// and build contexts the execution plane produced.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a scripted run for the next created container.
    pub fn plan(&self, run: PlannedRun) {
        self.state.lock().unwrap().planned.push_back(run);
    }

    /// Makes every subsequent build fail with this message.
    pub fn fail_builds_with(&self, message: &str) {
        self.state.lock().unwrap().build_error = Some(message.to_string());
    }

    /// Makes container creation fail, as when the engine is down.
    pub fn refuse_creation(&self) {
        self.state.lock().unwrap().refuse_create = true;
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn archives(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().archives.clone()
    }

    pub fn built_tags(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.builds.iter().map(|(tag, _)| tag.clone()).collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(&self, context: &BuildContext, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let paths = context
            .entries()
            .iter()
            .map(|(path, _)| path.clone())
            .collect();
        state.builds.push((tag.to_string(), paths));
        if let Some(message) = &state.build_error {
            return Err(Error::ImageBuild {
                message: message.clone(),
            });
        }
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(tag))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_create {
            return Err(Error::Engine {
                reason: "connection refused".to_string(),
            });
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let run = state
            .planned
            .pop_front()
            .unwrap_or_else(|| PlannedRun::success("null"));
        state.assigned.insert(id.clone(), run);
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn put_archive(&self, id: &str, path: &str, _tar_bytes: Vec<u8>) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .archives
            .push((id.to_string(), path.to_string()));
        Ok(())
    }

    async fn start_and_wait(&self, id: &str, _timeout: Duration) -> Result<WaitOutcome> {
        let state = self.state.lock().unwrap();
        let run = state
            .assigned
            .get(id)
            .ok_or_else(|| Error::Internal(format!("unknown container {id}")))?;
        Ok(run.wait)
    }

    async fn read_logs(&self, id: &str) -> Result<ContainerLogs> {
        let state = self.state.lock().unwrap();
        let run = state
            .assigned
            .get(id)
            .ok_or_else(|| Error::Internal(format!("unknown container {id}")))?;
        Ok(ContainerLogs {
            stdout: run.stdout.clone().into_bytes(),
            stderr: run.stderr.clone().into_bytes(),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.state.lock().unwrap().removed.push(id.to_string());
        Ok(())
    }
}
