use std::time::Duration;

use anyhow::{bail, Context, Error, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use leasehold_core::{
    client::{AcquireOptions, Acquisition, LeaseController, LeaseHandle},
    is_cancelled, server, CancelError,
};
use serde_json::{json, Value};
use tokio::{process::Command, select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{cli::Commands, initialize_stderr_logging, initialize_ui_logging, Cli};

pub struct App {
    cli: Cli,
    multi_progress: MultiProgress,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App {
            cli,
            multi_progress: MultiProgress::new(),
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        if self.cli.version() {
            println!("leasehold {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        if self.cli.no_ui() {
            initialize_stderr_logging()
        } else {
            initialize_ui_logging(self.multi_progress.clone());
        }

        let mut tasks = JoinSet::new();
        let cancel = CancellationToken::new();

        // Set up ctrl-c handler
        let ctrl_c_cancel = cancel.clone();
        tasks.spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down...");
                    ctrl_c_cancel.cancel();
                }
            }
        });

        let res = self.run_command(cancel.clone()).await;
        cancel.cancel();
        tasks.join_all().await;

        match res {
            Err(e) if is_cancelled(&e) => Ok(()),
            Err(e) => {
                error!(err = e.to_string());
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn run_command(&self, cancel: CancellationToken) -> Result<()> {
        match &self.cli.commands {
            Commands::Serve { host, port, .. } => {
                let config = self
                    .cli
                    .commands
                    .server_config()
                    .ok_or(Error::msg("expected server config"))?;
                let listener = server::bind(host, *port).await?;
                server::serve(listener, config, cancel).await
            }
            Commands::Acquire {
                name,
                owner,
                payload,
                command,
                ..
            } => {
                let controller = self.controller()?;
                let options = AcquireOptions {
                    owner: owner.clone(),
                    timeout: None,
                };
                match self.acquire(&controller, name, options, cancel.clone()).await? {
                    Acquisition::Delivered(data) => {
                        println!("{}", serde_json::to_string_pretty(&data)?);
                        Ok(())
                    }
                    Acquisition::Held(handle) => {
                        self.hold(handle, payload.clone(), command, cancel).await
                    }
                }
            }
            Commands::Status { .. } => {
                let status = self.controller()?.status().await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(())
            }
            Commands::Version => Ok(()),
        }
    }

    fn controller(&self) -> Result<LeaseController> {
        let config = self
            .cli
            .commands
            .controller_config()
            .ok_or(Error::msg("expected controller config"))?;
        Ok(LeaseController::new(config)?)
    }

    /// Acquire the lease, showing a spinner while parked behind another
    /// holder.
    #[tracing::instrument(skip(self, controller, options, cancel), err)]
    async fn acquire(
        &self,
        controller: &LeaseController,
        name: &str,
        options: AcquireOptions,
        cancel: CancellationToken,
    ) -> Result<Acquisition> {
        let progress = if self.cli.no_ui() {
            None
        } else {
            let bar = self.multi_progress.add(ProgressBar::new_spinner());
            bar.set_style(ProgressStyle::with_template("{spinner} {prefix} {msg}")?);
            bar.set_prefix("🔒");
            bar.set_message(format!("Waiting for lease {name}"));
            bar.enable_steady_tick(Duration::from_millis(100));
            Some(bar)
        };

        let res: Result<Acquisition> = select! {
            _ = cancel.cancelled() => Err(CancelError.into()),
            res = controller.acquire_with(name, options) => res.map_err(Error::from),
        };
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        res
    }

    /// Hold the lease while `command` runs, or until cancelled when there is
    /// no command, then release it.
    #[tracing::instrument(skip_all, fields(name = handle.name()))]
    async fn hold(
        &self,
        handle: LeaseHandle,
        payload: Option<Value>,
        command: &[String],
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(owner = handle.owner(), ttl = ?handle.ttl(), "lease held");

        let Some((program, args)) = command.split_first() else {
            cancel.cancelled().await;
            handle.release(payload).await?;
            return Err(CancelError.into());
        };

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting {program}"))?;
        let status = select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = status else {
            warn!("interrupted, releasing lease");
            handle.release(payload).await?;
            return Err(CancelError.into());
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                handle.release(payload).await?;
                return Err(Error::new(e).context(format!("waiting for {program}")));
            }
        };

        let code = status.code();
        debug!(?code, "command finished");
        handle.release(Some(with_exit_code(payload, code))).await?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }
}

/// Record the command's exit code in the release payload. Object payloads
/// gain an `exitCode` member; anything else is kept under `payload`.
fn with_exit_code(payload: Option<Value>, code: Option<i32>) -> Value {
    match payload {
        Some(Value::Object(mut fields)) => {
            fields.insert("exitCode".to_owned(), json!(code));
            Value::Object(fields)
        }
        None | Some(Value::Null) => json!({ "exitCode": code }),
        Some(other) => json!({ "exitCode": code, "payload": other }),
    }
}
