use crate::{
    controller::{BreakToggle, Controller},
    editor::{Editor, MessageLevel},
    session_config::{substitute, ConfigError, SessionConfig},
};
use anyhow::{Context as _, Result};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Gives the editor time to redraw its layout before asking a question.
const LAUNCH_PROMPT_DELAY: Duration = Duration::from_millis(400);

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    NoSession,
    /// Loaded, but not in any mode.
    Idle(SessionConfig),
    Alive {
        config: SessionConfig,
        mode: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SessionPath {
    dir: PathBuf,
    file: String,
}

/// One-shot hints shown to users of a freshly created session.
#[derive(Debug)]
struct HelpFlags {
    new: bool,
    launch_prompt: bool,
    session_show: bool,
}

/// The loaded session file and the mode the user is in.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    location: Option<SessionPath>,
    bpid_map: HashMap<String, String>,
    help: HelpFlags,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn is_debug_mode(mode: &str) -> bool {
    mode.starts_with("debug")
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::NoSession,
            location: None,
            bpid_map: HashMap::new(),
            help: HelpFlags {
                new: false,
                launch_prompt: true,
                session_show: true,
            },
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        match &self.state {
            SessionState::NoSession => None,
            SessionState::Idle(config) | SessionState::Alive { config, .. } => Some(config),
        }
    }

    fn config_mut(&mut self) -> Option<&mut SessionConfig> {
        match &mut self.state {
            SessionState::NoSession => None,
            SessionState::Idle(config) | SessionState::Alive { config, .. } => Some(config),
        }
    }

    pub fn current_mode(&self) -> Option<&str> {
        match &self.state {
            SessionState::Alive { mode, .. } => Some(mode),
            _ => None,
        }
    }

    /// A session is alive once it is in a mode and knows its file.
    pub fn is_alive(&self) -> bool {
        self.current_mode().is_some() && self.location.is_some()
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.location
            .as_ref()
            .map(|location| location.dir.join(&location.file))
    }

    /// Breakpoint numbers by `path:line`, for the current debug target.
    pub fn bpid_map(&self) -> &HashMap<String, String> {
        &self.bpid_map
    }

    /// Breakpoint numbers only mean something for one target.
    pub fn new_target(&mut self) {
        self.bpid_map.clear();
    }

    pub fn record_breakpoint(&mut self, toggle: &BreakToggle) {
        match toggle {
            BreakToggle::Inserted(location) => {
                self.bpid_map.insert(
                    format!("{}:{}", location.path, location.line),
                    location.number.clone(),
                );
            }
            BreakToggle::Deleted(number) => self.bpid_map.retain(|_, bpid| bpid != number),
            BreakToggle::Failed => {}
        }
    }

    pub async fn load_str<E: Editor>(
        &mut self,
        controller: &mut Controller<E>,
        text: &str,
    ) -> Result<()> {
        let config = SessionConfig::parse(text)?;
        self.load(controller, config).await
    }

    /// Leaves the current mode and enters the first mode of `config`.
    pub async fn load<E: Editor>(
        &mut self,
        controller: &mut Controller<E>,
        config: SessionConfig,
    ) -> Result<()> {
        let Some(first) = config.first_mode().map(str::to_string) else {
            return Err(ConfigError::NoModes.into());
        };
        self.teardown(controller).await?;
        self.state = SessionState::Idle(config);
        self.set_mode(controller, &first).await
    }

    pub async fn set_mode<E: Editor>(
        &mut self,
        controller: &mut Controller<E>,
        mode: &str,
    ) -> Result<()> {
        let declared = self
            .config()
            .map_or(false, |config| config.modes.contains_key(mode));
        if !declared {
            return controller.echo(&format!("Invalid mode: {mode}"), MessageLevel::Warning);
        }
        if self.current_mode() == Some(mode) {
            return controller.echo(&format!("Already in mode {mode}."), MessageLevel::Info);
        }

        self.teardown(controller).await?;
        self.state = match std::mem::replace(&mut self.state, SessionState::NoSession) {
            SessionState::Idle(config) | SessionState::Alive { config, .. } => {
                SessionState::Alive {
                    config,
                    mode: mode.to_string(),
                }
            }
            SessionState::NoSession => return Ok(()),
        };
        log::info!("entered mode {mode}");
        controller.editor_mut().mode_setup(mode)?;

        if is_debug_mode(mode) {
            match controller.dbg_start() {
                Ok(started) => {
                    if started {
                        self.new_target();
                    }
                    let setup = self
                        .config()
                        .and_then(|config| config.modes.get(mode))
                        .map(|actions| actions.setup.clone())
                        .unwrap_or_default();
                    self.run_actions(controller, &setup).await?;
                }
                Err(error) => {
                    log::error!("failed to start the debugger: {error:#}");
                    controller.echo(
                        &format!("Failed to start the debugger: {error:#}"),
                        MessageLevel::Error,
                    )?;
                }
            }
        }
        controller.update_buffers(None).await?;
        self.prompt_launch(controller).await
    }

    /// Leaves the current mode, if any. Returns whether there was one.
    pub async fn teardown<E: Editor>(&mut self, controller: &mut Controller<E>) -> Result<bool> {
        let (mode, actions) = match &self.state {
            SessionState::Alive { config, mode } => (
                mode.clone(),
                config
                    .modes
                    .get(mode)
                    .map(|actions| actions.teardown.clone())
                    .unwrap_or_default(),
            ),
            _ => return Ok(false),
        };

        self.run_actions(controller, &actions).await?;
        controller.editor_mut().mode_teardown(&mode)?;
        if let SessionState::Alive { config, .. } =
            std::mem::replace(&mut self.state, SessionState::NoSession)
        {
            self.state = SessionState::Idle(config);
        }
        if is_debug_mode(&mode) {
            controller.dbg_stop().await?;
        }
        log::info!("left mode {mode}");
        Ok(true)
    }

    /// Runs a mode's command list with refreshes suppressed. A command that
    /// cannot be expanded stops the list; earlier commands are not undone.
    async fn run_actions<E: Editor>(
        &self,
        controller: &mut Controller<E>,
        actions: &[String],
    ) -> Result<()> {
        let variables = self
            .config()
            .map(|config| config.variables.clone())
            .unwrap_or_default();
        let _busy = controller.busy().guard();
        for action in actions {
            match substitute(action, &variables) {
                Ok(command) => {
                    controller.execute(&command).await?;
                }
                Err(error) => {
                    log::error!("aborting actions at {action:?}: {error}");
                    controller.echo(&format!("Action aborted: {error}"), MessageLevel::Error)?;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn prompt_launch<E: Editor>(&mut self, controller: &mut Controller<E>) -> Result<()> {
        if !(self.help.new && self.help.launch_prompt && self.current_mode() == Some("debug")) {
            return Ok(());
        }
        smol::Timer::after(LAUNCH_PROMPT_DELAY).await;
        let answer = controller
            .editor_mut()
            .eval("input('Launch the target? [y=yes] ', 'y')")
            .await?;
        if answer.as_str() == Some("y") {
            if let Some(debug) = self
                .config_mut()
                .and_then(|config| config.modes.get_mut("debug"))
            {
                debug.setup.push("run".into());
            }
            controller.execute("run").await?;
            controller.echo("Process launched! Try `:GGsession show`", MessageLevel::Info)?;
        }
        self.help.launch_prompt = false;
        Ok(())
    }

    /// Handles `:GGsession <command> <args>`.
    pub async fn handle<E: Editor>(
        &mut self,
        controller: &mut Controller<E>,
        command: &str,
        args: &[String],
    ) -> Result<()> {
        match command {
            "new" => self.handle_new(controller).await,
            "reload" => match self.config_path() {
                None => controller.echo("No active session!", MessageLevel::Warning),
                Some(_) if !args.is_empty() => {
                    controller.echo("Too many arguments!", MessageLevel::Warning)
                }
                Some(path) => self.handle_load(controller, &path).await,
            },
            "load" => match args {
                [] => {
                    let found = controller
                        .editor_mut()
                        .eval("findfile(g:gdb#session#file, \".;\")")
                        .await?;
                    match found.as_str().filter(|path| !path.is_empty()) {
                        Some(path) => self.handle_load(controller, Path::new(path)).await,
                        None => controller.echo("No session file found.", MessageLevel::Warning),
                    }
                }
                [path] => self.handle_load(controller, Path::new(path)).await,
                _ => controller.echo("Too many arguments!", MessageLevel::Warning),
            },
            "show" => self.handle_show(controller).await,
            _ => controller.echo(
                &format!("Invalid sub-command: {command}"),
                MessageLevel::Warning,
            ),
        }
    }

    /// Asks before replacing a live session. Returns true if the user said no.
    async fn discard_declined<E: Editor>(&self, controller: &mut Controller<E>) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        let answer = controller
            .editor_mut()
            .eval("gdb#session#discard_prompt()")
            .await?;
        if answer.as_i64() == Some(0) {
            controller.echo("Session left unchanged!", MessageLevel::Info)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn handle_new<E: Editor>(&mut self, controller: &mut Controller<E>) -> Result<()> {
        if self.discard_declined(controller).await? {
            return Ok(());
        }

        let answer = controller.editor_mut().eval("gdb#session#new()").await?;
        let Some(file) = answer
            .get("_file")
            .and_then(Value::as_str)
            .filter(|file| !file.is_empty())
        else {
            return controller.echo("Skipped -- no session was created!", MessageLevel::Warning);
        };
        if !self.set_path(controller, Path::new(file))? {
            return Ok(());
        }

        let mut config = SessionConfig::template();
        let target = answer
            .get("target")
            .and_then(Value::as_str)
            .filter(|target| !target.is_empty());
        if let Some(target) = target {
            let absolute = controller.editor_mut().cwd().await?.join(target);
            config
                .variables
                .insert("target".into(), self.path_shorten(&absolute));
            if let Some(debug) = config.modes.get_mut("debug") {
                debug.setup.insert(0, "file {target}".into());
            }
        }

        self.load(controller, config).await?;
        if target.is_some() {
            self.help.new = true;
        }
        controller.echo("New session created!", MessageLevel::Info)
    }

    async fn handle_load<E: Editor>(
        &mut self,
        controller: &mut Controller<E>,
        path: &Path,
    ) -> Result<()> {
        if self.discard_declined(controller).await? {
            return Ok(());
        }

        let config = match read_config(path) {
            Ok(config) => config,
            Err(error) => {
                log::warn!("bad session file: {error:#}");
                return controller.echo(
                    &format!("Bad session file: {error:#}"),
                    MessageLevel::Error,
                );
            }
        };
        self.load(controller, config).await?;
        if self.set_path(controller, path)? {
            controller.echo(&format!("Loaded {}", path.display()), MessageLevel::Info)?;
        }
        Ok(())
    }

    async fn handle_show<E: Editor>(&mut self, controller: &mut Controller<E>) -> Result<()> {
        let (Some(path), Some(config)) = (self.config_path(), self.config()) else {
            return controller.echo("No active session.", MessageLevel::Warning);
        };
        if !self.is_alive() {
            return controller.echo("No active session.", MessageLevel::Warning);
        }
        let lines: Vec<String> = config
            .to_pretty_json()?
            .lines()
            .map(str::to_string)
            .collect();

        let buffer = controller
            .editor_mut()
            .buffer_add(&path.to_string_lossy())
            .await?;
        controller.editor_mut().open_in_tab(buffer)?;
        controller.editor_mut().set_buffer_lines(buffer, &lines)?;
        if self.help.new && self.help.session_show {
            controller.echo(
                "Save this file, and do `:GGsession reload` to load any changes made.",
                MessageLevel::Info,
            )?;
            self.help.session_show = false;
        }
        Ok(())
    }

    /// Remembers where the session file lives and moves there, so relative
    /// paths in the session resolve against it.
    fn set_path<E: Editor>(&mut self, controller: &mut Controller<E>, path: &Path) -> Result<bool> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let trailing_slash = path.to_string_lossy().ends_with('/');
        let (Some(dir), Some(file), false) =
            (absolute.parent(), absolute.file_name(), trailing_slash)
        else {
            controller.echo("Error: invalid path!", MessageLevel::Error)?;
            return Ok(false);
        };
        if let Err(error) = controller.editor_mut().change_dir(dir) {
            controller.echo(&format!("{error:#}"), MessageLevel::Error)?;
            return Ok(false);
        }
        self.location = Some(SessionPath {
            dir: dir.to_path_buf(),
            file: file.to_string_lossy().into_owned(),
        });
        Ok(true)
    }

    fn path_shorten(&self, absolute: &Path) -> String {
        let relative = self
            .location
            .as_ref()
            .and_then(|location| absolute.strip_prefix(&location.dir).ok());
        relative
            .unwrap_or(absolute)
            .to_string_lossy()
            .into_owned()
    }
}

fn read_config(path: &Path) -> Result<SessionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(SessionConfig::parse(&text)?)
}
