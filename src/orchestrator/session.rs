//! Per-run session state.
//!
//! A session owns the resolved configuration and the control directory. It is
//! passed explicitly to the components that need it.

use crate::control::ControlChannel;
use crate::engine::EngineArgs;
use crate::error::SessionError;
use crate::model::SessionConfig;
use crate::preview::Converter;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub(crate) struct Session {
    config: SessionConfig,
    channel: Arc<ControlChannel>,
    started: Instant,
    started_utc: String,
}

impl Session {
    /// Create the session's control directory.
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let channel = ControlChannel::open(&config.control_root)?;
        Ok(Self {
            config,
            channel: Arc::new(channel),
            started: Instant::now(),
            started_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    pub fn control_dir(&self) -> &Path {
        self.channel.path()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn started_utc(&self) -> &str {
        &self.started_utc
    }

    pub fn engine_args(&self) -> EngineArgs {
        EngineArgs {
            program: self.config.engine.clone(),
            scene: self.config.scene.clone(),
            indirect_workers: self.config.indirect_workers,
            direct_workers: self.config.direct_workers,
        }
    }

    pub fn converter(&self) -> Converter {
        Converter {
            program: self.config.converter.clone(),
            args: self.config.converter_args.clone(),
        }
    }

    /// Remove the control directory. Callers must have stopped every writer
    /// they own (engine, scheduler) first.
    pub fn close(&self) {
        self.channel.close();
    }
}
