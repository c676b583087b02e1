//! Command-line parsing for `hived`.
//!
//! `hived master|worker [--listen ADDR] [--port PORT] [--cert PATH]
//! [--key PATH] [--ca PATH] [--token PATH] [--connect HOST:PORT]...`
//!
//! Flags override the config file and environment.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use hive_core::config::HiveConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Master,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub mode: Mode,
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub token: Option<PathBuf>,
    pub connect: Vec<String>,
}

pub const USAGE: &str = "usage: hived master|worker [--listen ADDR] [--port PORT] [--cert PATH] \
[--key PATH] [--ca PATH] [--token PATH] [--connect HOST:PORT]...";

impl Args {
    pub fn parse<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let mode = match args.next().as_deref() {
            Some("master") => Mode::Master,
            Some("worker") => Mode::Worker,
            Some(other) => bail!("unknown mode '{other}'\n{USAGE}"),
            None => bail!("{USAGE}"),
        };

        let mut parsed = Args {
            mode,
            listen: None,
            port: None,
            cert: None,
            key: None,
            ca: None,
            token: None,
            connect: Vec::new(),
        };

        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{flag} needs a value"))
            };
            match flag.as_str() {
                "--listen" => parsed.listen = Some(value()?),
                "--port" => {
                    let raw = value()?;
                    parsed.port = Some(raw.parse().with_context(|| format!("bad port '{raw}'"))?);
                }
                "--cert" => parsed.cert = Some(value()?.into()),
                "--key" => parsed.key = Some(value()?.into()),
                "--ca" => parsed.ca = Some(value()?.into()),
                "--token" => parsed.token = Some(value()?.into()),
                "--connect" => parsed.connect.push(value()?),
                "-h" | "--help" => bail!("{USAGE}"),
                other => bail!("unknown flag '{other}'\n{USAGE}"),
            }
        }
        Ok(parsed)
    }

    /// Fold flags into the loaded configuration.
    pub fn apply(&self, config: &mut HiveConfig) {
        if let Some(listen) = &self.listen {
            config.network.bind_addr = listen.clone();
        }
        if let Some(port) = self.port {
            match self.mode {
                Mode::Worker => {
                    config.network.worker_port_min = port;
                    config.network.worker_port_max = port;
                }
                Mode::Master => {
                    config.network.api_port_min = port;
                    config.network.api_port_max = port;
                }
            }
        }
        match self.mode {
            Mode::Worker => {
                if let Some(cert) = &self.cert {
                    config.security.cert_path = cert.clone();
                }
                if let Some(key) = &self.key {
                    config.security.key_path = key.clone();
                }
            }
            Mode::Master => {
                if let Some(cert) = &self.cert {
                    config.security.client_cert_path = Some(cert.clone());
                }
                if let Some(key) = &self.key {
                    config.security.client_key_path = Some(key.clone());
                }
            }
        }
        if let Some(ca) = &self.ca {
            config.security.ca_path = ca.clone();
        }
        if let Some(token) = &self.token {
            config.security.token_path = token.clone();
        }
        config
            .network
            .static_workers
            .extend(self.connect.iter().cloned());
    }
}
