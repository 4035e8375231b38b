use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Printer not found: {0}")]
    PrinterNotFound(String),

    #[error("Printer not connected: {0}")]
    NotConnected(String),

    #[error("No printers connected")]
    NoPrintersConnected,

    #[error("Transport timed out: {0}")]
    TransportTimeout(String),

    #[error("Transport busy: {0}")]
    TransportBusy(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Printer out of range: {0}")]
    OutOfRange(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Device selection cancelled by user")]
    UserCancelled,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No writable channel found: {0}")]
    ProtocolMismatch(String),

    #[error("Retry ceiling reached for printer {0}")]
    RetryCeiling(String),

    #[error("Connection attempt superseded for printer {0}")]
    Superseded(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Stable taxonomy name, reported in per-printer print results.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::Config(_) => "Config",
            LinkError::PrinterNotFound(_) => "PrinterNotFound",
            LinkError::NotConnected(_) => "NotConnected",
            LinkError::NoPrintersConnected => "NoPrintersConnected",
            LinkError::TransportTimeout(_) => "TransportTimeout",
            LinkError::TransportBusy(_) => "TransportBusy",
            LinkError::TransportUnavailable(_) => "TransportUnavailable",
            LinkError::OutOfRange(_) => "OutOfRange",
            LinkError::Disconnected(_) => "Disconnected",
            LinkError::UserCancelled => "UserCancelled",
            LinkError::PermissionDenied(_) => "PermissionDenied",
            LinkError::ProtocolMismatch(_) => "ProtocolMismatch",
            LinkError::RetryCeiling(_) => "RetryCeiling",
            LinkError::Superseded(_) => "Superseded",
            LinkError::InvalidTransition(_) => "InvalidTransition",
            LinkError::InvalidRequest(_) => "InvalidRequest",
            LinkError::Usb(_) => "Usb",
            LinkError::Bluetooth(_) => "Bluetooth",
            LinkError::Relay(_) => "Relay",
            LinkError::Storage(_) => "Storage",
            LinkError::Io(_) => "Io",
            LinkError::Json(_) => "Json",
            LinkError::Other(_) => "Other",
        }
    }

    /// Whether an open attempt that failed this way may be repeated within a sweep.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::TransportTimeout(_)
            | LinkError::TransportBusy(_)
            | LinkError::OutOfRange(_)
            | LinkError::Disconnected(_)
            | LinkError::Relay(_)
            | LinkError::Io(_) => true,
            LinkError::Bluetooth(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("range")
                    || lower.contains("timed out")
                    || lower.contains("timeout")
                    || lower.contains("disconnected")
            }
            LinkError::Usb(e) => matches!(
                e,
                rusb::Error::Timeout | rusb::Error::Busy | rusb::Error::Interrupted | rusb::Error::Io
            ),
            _ => false,
        }
    }

    /// Errors that mean the open session is gone, as opposed to a single failed write.
    pub fn is_liveness_loss(&self) -> bool {
        match self {
            LinkError::Disconnected(_) | LinkError::OutOfRange(_) => true,
            LinkError::Usb(e) => matches!(e, rusb::Error::NoDevice | rusb::Error::NotFound),
            _ => false,
        }
    }

    /// Errors that need the user to act outside the application.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            LinkError::PermissionDenied(_)
                | LinkError::TransportUnavailable(_)
                | LinkError::Usb(rusb::Error::Access)
        )
    }

    /// Text shown to the operator when this error ends a connection attempt.
    pub fn user_message(&self) -> String {
        match self {
            LinkError::PermissionDenied(_) | LinkError::Usb(rusb::Error::Access) => format!(
                "Access to the printer was denied ({}). Grant Bluetooth/USB access for this application in the system settings. \
                 For USB printers, close other printer software or disable the OS printer driver, then unplug and replug the printer.",
                self
            ),
            LinkError::TransportUnavailable(detail) => format!(
                "This transport is not available on this system ({}). Check that the Bluetooth adapter or USB stack is present and enabled.",
                detail
            ),
            LinkError::TransportBusy(detail) => format!(
                "The printer is in use by another application or driver ({}). Close other printer software and try again.",
                detail
            ),
            LinkError::TransportTimeout(_) | LinkError::OutOfRange(_) | LinkError::Disconnected(_) => {
                "The printer did not respond. Check that it is powered on and in range.".to_string()
            }
            LinkError::ProtocolMismatch(_) => {
                "The device does not expose a printer channel. It may not be a supported receipt printer.".to_string()
            }
            LinkError::NoPrintersConnected => "No printers are connected.".to_string(),
            LinkError::NotConnected(name) => format!("Printer {} is not connected.", name),
            other => other.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LinkError::TransportTimeout("operation timed out".to_string())
    }
}

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => {
                LinkError::PermissionDenied("Bluetooth permission denied".to_string())
            }
            btleplug::Error::DeviceNotFound => LinkError::OutOfRange("device not in range".to_string()),
            btleplug::Error::NotConnected => LinkError::Disconnected("GATT server is disconnected".to_string()),
            btleplug::Error::NotSupported(what) => LinkError::TransportUnavailable(what),
            btleplug::Error::TimedOut(d) => LinkError::TransportTimeout(format!("BLE operation timed out after {:?}", d)),
            other => LinkError::Bluetooth(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LinkError::TransportTimeout(format!("relay request timed out: {}", e))
        } else {
            LinkError::Relay(e.to_string())
        }
    }
}
