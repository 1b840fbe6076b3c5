//! Ephemeral loopback port allocation.
//!
//! The OS hands out a free port when binding port 0. The listener is closed
//! again before the engine binds, so another process can in principle take
//! the port in between; the adapter relaunches on a fresh port when the
//! engine reports the bind failure.

use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::error::VerifyError;

/// Find a free loopback TCP port.
pub fn acquire() -> Result<u16, VerifyError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(VerifyError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(VerifyError::PortAllocation)?
        .port();
    drop(listener);
    debug!(local_port = port, "allocated ephemeral port");
    Ok(port)
}
