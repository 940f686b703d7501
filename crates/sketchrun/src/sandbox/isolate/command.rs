//! Argument builder for the `isolate` CLI
//!
//! See isolate(1): <https://www.ucw.cz/isolate/isolate.1.html>

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{MountConfig, ResourceLimits};

/// What an `isolate` invocation does to its box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    Init,
    Run,
    Cleanup,
}

impl IsolateAction {
    fn flag(self) -> &'static str {
        match self {
            IsolateAction::Init => "--init",
            IsolateAction::Run => "--run",
            IsolateAction::Cleanup => "--cleanup",
        }
    }
}

/// Builder for one `isolate` command line
#[derive(Debug)]
pub struct IsolateCommand {
    isolate_path: PathBuf,
    box_id: u32,
    action: IsolateAction,
    cgroup: bool,
    limits: ResourceLimits,
    mounts: Vec<MountConfig>,
    env: BTreeMap<String, String>,
    meta_file: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    working_dir: Option<String>,
    command: Vec<String>,
}

impl IsolateCommand {
    /// A `--run` command for box `box_id` with no limits set
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            box_id,
            action: IsolateAction::Run,
            cgroup: false,
            limits: ResourceLimits::unlimited(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            meta_file: None,
            stdout: None,
            stderr: None,
            working_dir: None,
            command: Vec::new(),
        }
    }

    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    /// Use cgroup accounting (`--cg`, and `--cg-mem` instead of `--mem`)
    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Host path where isolate writes the meta file
    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    /// Path inside the box for the program's stdout
    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Path inside the box for the program's stderr
    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Full argv, program first
    pub fn build(self) -> Vec<String> {
        let mut args = vec![
            self.isolate_path.to_string_lossy().into_owned(),
            format!("--box-id={}", self.box_id),
        ];
        if self.cgroup {
            args.push("--cg".to_owned());
        }
        args.push(self.action.flag().to_owned());

        if self.action == IsolateAction::Run {
            self.push_run_args(&mut args);
        }
        args
    }

    fn push_run_args(self, args: &mut Vec<String>) {
        let limits = &self.limits;
        if let Some(time) = limits.time_limit {
            args.push(format!("--time={time}"));
        }
        if let Some(wall_time) = limits.wall_time_limit {
            args.push(format!("--wall-time={wall_time}"));
        }
        if let Some(extra_time) = limits.extra_time {
            args.push(format!("--extra-time={extra_time}"));
        }
        if let Some(memory) = limits.memory_limit {
            let flag = if self.cgroup { "--cg-mem" } else { "--mem" };
            args.push(format!("{flag}={memory}"));
        }
        if let Some(stack) = limits.stack_limit {
            args.push(format!("--stack={stack}"));
        }
        // A bare --processes lifts isolate's default of a single process
        match limits.max_processes {
            Some(count) => args.push(format!("--processes={count}")),
            None => args.push("--processes".to_owned()),
        }
        if let Some(fsize) = limits.max_file_size {
            args.push(format!("--fsize={fsize}"));
        }
        if let Some(open_files) = limits.max_open_files {
            args.push(format!("--open-files={open_files}"));
        }

        for mount in &self.mounts {
            if mount.optional && !Path::new(&mount.source).exists() {
                continue;
            }
            let mut rule = format!("--dir={}={}", mount.target, mount.source);
            if mount.writable {
                rule.push_str(":rw");
            }
            if mount.optional {
                rule.push_str(":maybe");
            }
            args.push(rule);
        }

        args.extend(self.env.iter().map(|(k, v)| format!("--env={k}={v}")));

        if let Some(meta) = &self.meta_file {
            args.push(format!("--meta={}", meta.display()));
        }
        if let Some(stdout) = &self.stdout {
            args.push(format!("--stdout={}", stdout.display()));
        }
        if let Some(stderr) = &self.stderr {
            args.push(format!("--stderr={}", stderr.display()));
        }
        if let Some(dir) = &self.working_dir {
            args.push(format!("--chdir={dir}"));
        }

        args.push("--".to_owned());
        args.extend(self.command);
    }
}
