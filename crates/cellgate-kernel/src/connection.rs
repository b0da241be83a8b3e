//! Kernel connection files.
//!
//! A connection file tells the kernel which ports to bind and which key to
//! sign messages with. The client reads the same structure to connect.

use std::fmt;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KernelError;
use crate::wire::Signer;

pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// The five sockets a kernel exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Shell,
    IoPub,
    Stdin,
    Control,
    Heartbeat,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Shell => "shell",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
            Channel::Heartbeat => "hb",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub key: String,
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

impl ConnectionInfo {
    /// Reserve five distinct free TCP ports on `ip` and generate a signing key.
    ///
    /// Ports are found by binding ephemeral listeners and releasing them, so a
    /// different process can still grab one before the kernel binds it.
    pub fn allocate(ip: &str, kernel_name: &str) -> io::Result<Self> {
        // Hold every listener until all five ports are known so none repeat.
        let listeners = (0..5)
            .map(|_| TcpListener::bind((ip, 0)))
            .collect::<io::Result<Vec<_>>>()?;
        let ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|addr| addr.port()))
            .collect::<io::Result<Vec<_>>>()?;
        drop(listeners);

        Ok(Self {
            ip: ip.to_string(),
            transport: "tcp".into(),
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            key: Uuid::new_v4().to_string(),
            signature_scheme: SIGNATURE_SCHEME.into(),
            kernel_name: kernel_name.to_string(),
        })
    }

    pub fn port(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Shell => self.shell_port,
            Channel::IoPub => self.iopub_port,
            Channel::Stdin => self.stdin_port,
            Channel::Control => self.control_port,
            Channel::Heartbeat => self.hb_port,
        }
    }

    pub fn endpoint(&self, channel: Channel) -> String {
        format!("{}://{}:{}", self.transport, self.ip, self.port(channel))
    }

    pub fn signer(&self) -> Signer {
        Signer::new(&self.key)
    }

    /// Write the connection file into `dir` and return its path.
    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("kernel-{}.json", Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        // The file holds the signing key.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(path)
    }

    pub fn read_from(path: &Path) -> Result<Self, KernelError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            KernelError::Protocol(format!("invalid connection file {}: {e}", path.display()))
        })
    }
}
