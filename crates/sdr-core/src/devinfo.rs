//! Device identity and identifier-string parsing.
//!
//! Devices are selected with identifier strings of the form
//!
//! ```text
//! <backend>:[serial=<prefix>] [bus=<n>] [addr=<n>] [instance=<n>]
//! ```
//!
//! where `<backend>` is `*` (or empty) for any backend. Fields that are not
//! given act as wildcards.
//!
//! ```
//! use sdr_core::{BackendKind, DevInfo};
//!
//! let wanted: DevInfo = "sim:serial=a1b2".parse()?;
//! assert_eq!(wanted.backend, BackendKind::Sim);
//!
//! let found = DevInfo {
//!     serial: "a1b2c3d4".into(),
//!     ..DevInfo::any()
//! }
//! .with_backend(BackendKind::Sim);
//! assert!(wanted.matches(&found));
//! # Ok::<(), sdr_core::SdrError>(())
//! ```

use crate::error::SdrError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Wildcard; only meaningful in identifiers.
    Any,
    /// USB device accessed through a host USB stack.
    Usb,
    /// In-process simulated device.
    Sim,
}

impl BackendKind {
    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "" | "*" => Some(BackendKind::Any),
            "usb" | "libusb" => Some(BackendKind::Usb),
            "sim" => Some(BackendKind::Sim),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Any => "*",
            BackendKind::Usb => "usb",
            BackendKind::Sim => "sim",
        };
        write!(f, "{}", label)
    }
}

/// Identity of one attached device, or a partial identity used as a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevInfo {
    pub backend: BackendKind,
    /// Full serial number; empty means "any" in a filter.
    pub serial: String,
    pub usb_bus: Option<u8>,
    pub usb_addr: Option<u8>,
    pub instance: Option<u32>,
    pub manufacturer: String,
    pub product: String,
}

impl DevInfo {
    /// A filter that matches every device.
    pub fn any() -> Self {
        Self {
            backend: BackendKind::Any,
            serial: String::new(),
            usb_bus: None,
            usb_addr: None,
            instance: None,
            manufacturer: String::new(),
            product: String::new(),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// `true` when `self`, read as a filter, accepts `device`.
    ///
    /// Unset filter fields are wildcards; the serial matches by prefix.
    pub fn matches(&self, device: &DevInfo) -> bool {
        if self.backend != BackendKind::Any && self.backend != device.backend {
            return false;
        }
        if !self.serial.is_empty()
            && !device
                .serial
                .to_ascii_lowercase()
                .starts_with(&self.serial.to_ascii_lowercase())
        {
            return false;
        }
        let field_ok = |want: Option<u32>, have: Option<u32>| match want {
            None => true,
            Some(w) => have == Some(w),
        };
        field_ok(self.usb_bus.map(u32::from), device.usb_bus.map(u32::from))
            && field_ok(self.usb_addr.map(u32::from), device.usb_addr.map(u32::from))
            && field_ok(self.instance, device.instance)
    }
}

impl Default for DevInfo {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for DevInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.backend)?;
        let mut sep = "";
        if !self.serial.is_empty() {
            write!(f, "serial={}", self.serial)?;
            sep = " ";
        }
        if let Some(bus) = self.usb_bus {
            write!(f, "{}bus={}", sep, bus)?;
            sep = " ";
        }
        if let Some(addr) = self.usb_addr {
            write!(f, "{}addr={}", sep, addr)?;
            sep = " ";
        }
        if let Some(instance) = self.instance {
            write!(f, "{}instance={}", sep, instance)?;
        }
        Ok(())
    }
}

impl FromStr for DevInfo {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |message: String| SdrError::invalid_argument("parse_identifier", message);

        let (backend, rest) = match s.split_once(':') {
            Some((backend, rest)) => (backend, rest),
            None => (s, ""),
        };
        let backend = BackendKind::parse(backend)
            .ok_or_else(|| bad(format!("unknown backend '{}'", backend.trim())))?;

        let mut info = DevInfo::any().with_backend(backend);
        for field in rest.split(|c: char| c == ',' || c.is_whitespace()) {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| bad(format!("expected key=value, got '{}'", field)))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "serial" => {
                    if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(bad(format!("invalid serial '{}'", value)));
                    }
                    info.serial = value.to_string();
                }
                "bus" => {
                    info.usb_bus = Some(
                        value
                            .parse()
                            .map_err(|_| bad(format!("invalid bus '{}'", value)))?,
                    );
                }
                "addr" | "address" => {
                    info.usb_addr = Some(
                        value
                            .parse()
                            .map_err(|_| bad(format!("invalid addr '{}'", value)))?,
                    );
                }
                "instance" => {
                    info.instance = Some(
                        value
                            .parse()
                            .map_err(|_| bad(format!("invalid instance '{}'", value)))?,
                    );
                }
                other => return Err(bad(format!("unknown identifier key '{}'", other))),
            }
        }
        Ok(info)
    }
}
