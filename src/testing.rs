//! Recording fakes for the pipeline collaborators.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::artifact::{Patcher, Repackager, Stager};
use crate::error::{RemasterError, Result};
use crate::mount::Mounter;
use crate::pipeline::Toolchain;
use crate::signal::CancelToken;

pub type Events = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
pub enum Outcome {
    #[default]
    Succeed,
    Fail,
    /// Flip the token as if a signal landed mid-stage, then finish normally.
    Signal(CancelToken),
}

fn settle(name: &str, events: &Events, outcome: &Outcome) -> Result<()> {
    events.lock().unwrap().push(name.to_string());
    match outcome {
        Outcome::Succeed => Ok(()),
        Outcome::Fail => Err(RemasterError::ExternalCommandFailed {
            program: name.to_string(),
            status: None,
            context: format!("fake {name}"),
        }),
        Outcome::Signal(token) => {
            token.cancel();
            Ok(())
        }
    }
}

fn leaf(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Records `mount`, `bind <target>` and `unmount <target>` by leaf name.
#[derive(Default)]
pub struct FakeMounter {
    pub events: Events,
    pub mount: Outcome,
    pub bind: Outcome,
    pub unmount: Outcome,
}

impl Mounter for FakeMounter {
    fn mount_loop(&self, _: &Path, _: &Path, _: &CancelToken) -> Result<()> {
        settle("mount", &self.events, &self.mount)
    }

    fn bind(&self, _: &Path, target: &Path, _: &CancelToken) -> Result<()> {
        settle(&format!("bind {}", leaf(target)), &self.events, &self.bind)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        settle(&format!("unmount {}", leaf(target)), &self.events, &self.unmount)
    }
}

pub struct FakeStep {
    pub events: Events,
    pub outcome: Outcome,
}

impl Stager for FakeStep {
    fn stage(&self, _: &Path, extraction_root: &Path, _: &CancelToken) -> Result<()> {
        fs::write(extraction_root.join("staged"), b"x").unwrap();
        settle("stage", &self.events, &self.outcome)
    }
}

impl Patcher for FakeStep {
    fn patch(&self, _: &Path, _: &Path, _: &CancelToken) -> Result<()> {
        settle("patch", &self.events, &self.outcome)
    }
}

impl Repackager for FakeStep {
    fn repack(&self, _: &Path, _: &Path, output_image: &Path, _: &CancelToken) -> Result<()> {
        settle("repack", &self.events, &self.outcome)?;
        fs::write(output_image, b"remastered").unwrap();
        Ok(())
    }
}

/// Per-collaborator outcomes for [`toolchain`].
#[derive(Clone, Default)]
pub struct Script {
    pub mount: Outcome,
    pub unmount: Outcome,
    pub stage: Outcome,
    pub patch: Outcome,
    pub repack: Outcome,
}

/// A toolchain of fakes that all log into one shared event list.
pub fn toolchain(script: Script) -> (Toolchain, Events) {
    let events: Events = Arc::default();
    let step = |outcome: Outcome| FakeStep {
        events: Arc::clone(&events),
        outcome,
    };
    let tools = Toolchain {
        mounter: Arc::new(FakeMounter {
            events: Arc::clone(&events),
            mount: script.mount,
            bind: Outcome::Succeed,
            unmount: script.unmount,
        }),
        stager: Box::new(step(script.stage)),
        patcher: Box::new(step(script.patch)),
        repackager: Box::new(step(script.repack)),
    };
    (tools, events)
}

pub fn recorded(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}
