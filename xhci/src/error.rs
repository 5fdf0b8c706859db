use crate::trb::CompletionCode;
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum XhciError {
    /// The controller did not react within the poll budget of the named wait.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The operational registers did not read zero after a host controller
    /// reset.
    #[error("operational registers not at defaults after reset")]
    ResetFailed,
    #[error("no device slots available")]
    NoSlotsAvailable,
    #[error("command failed: {0}")]
    CommandFailed(CompletionCode),
    #[error("transfer failed: {0}")]
    TransferFailed(CompletionCode),
    #[error("reset of port {0} failed")]
    PortResetFailed(u8),
    #[error("dma allocation of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("mapping the MMIO window failed")]
    MmioMapFailed,
}
