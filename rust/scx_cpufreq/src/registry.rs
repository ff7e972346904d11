// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use log::debug;

use crate::config::Config;
use crate::error::CpufreqError;
use crate::error::Result;
use crate::session::CpufreqSession;
use crate::sysfs::Gateway;
use crate::sysfs::SysfsGateway;

type GatewayFactory<G> = Box<dyn Fn(&Config) -> Result<G> + Send + Sync>;

/// Hands out a shared [`CpufreqSession`].
///
/// The first request runs discovery. Later requests share the same session
/// until it is closed, after which the next request discovers from scratch.
/// Construction happens under the registry lock, so concurrent first
/// requests discover only once. A host with an active session elsewhere in
/// the process is refused with [`CpufreqError::HostBusy`].
pub struct SessionRegistry<G: Gateway = SysfsGateway> {
    config: Config,
    factory: GatewayFactory<G>,
    slot: Mutex<Option<Arc<CpufreqSession<G>>>>,
}

impl<G: Gateway> SessionRegistry<G> {
    pub fn new<F>(config: Config, factory: F) -> SessionRegistry<G>
    where
        F: Fn(&Config) -> Result<G> + Send + Sync + 'static,
    {
        SessionRegistry {
            config,
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Return the active session, creating one if there is none.
    pub fn get(&self) -> Result<Arc<CpufreqSession<G>>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = slot.as_ref() {
            if session.is_active() {
                return Ok(session.clone());
            }
            debug!("cpufreq session was closed, discovering again");
        }

        // Drop the closed session before touching the host again.
        *slot = None;
        let gateway = (self.factory)(&self.config)?;
        let session = Arc::new(CpufreqSession::new(gateway, &self.config)?);
        *slot = Some(session.clone());
        Ok(session)
    }

    /// The active session, if any, without creating one.
    pub fn current(&self) -> Option<Arc<CpufreqSession<G>>> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().filter(|s| s.is_active()).cloned()
    }
}

impl SessionRegistry<SysfsGateway> {
    /// Registry backed by the sysfs tree named in `config`.
    pub fn with_sysfs(config: Config) -> SessionRegistry<SysfsGateway> {
        SessionRegistry::new(config, |config| {
            Ok(SysfsGateway::new_with_path(config.sysfs_root.clone()))
        })
    }
}

static REGISTRY: OnceLock<SessionRegistry> = OnceLock::new();

/// Process-wide session on the host's sysfs, configured by `config`.
///
/// The first call fixes the configuration of the process-wide registry.
/// Later calls must pass the same config.
pub fn init_session(config: Config) -> Result<Arc<CpufreqSession>> {
    let registry = REGISTRY.get_or_init(|| SessionRegistry::with_sysfs(config.clone()));
    if *registry.config() != config {
        return Err(CpufreqError::Config(format!(
            "process-wide cpufreq session already configured with {:?}",
            registry.config()
        )));
    }
    registry.get()
}

/// Process-wide session. Uses the default config unless [`init_session`]
/// configured it first.
pub fn session() -> Result<Arc<CpufreqSession>> {
    REGISTRY
        .get_or_init(|| SessionRegistry::with_sysfs(Config::default()))
        .get()
}
