// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by connections, servers and their background jobs.
///
/// Every failure is delivered as a value through the job handle of the
/// operation that caused it. A client dropping off a server is not an error;
/// it is reported as [`ReadEvent::Closed`](crate::bluetooth::ReadEvent).
#[derive(Error, Debug)]
pub enum Error {
    /// Socket allocation or the connect call failed.
    #[error("Cannot connect: {}", describe_status(.code, .source))]
    Connect {
        /// OS status code, when the failure came from a syscall.
        code: Option<i32>,
        source: io::Error,
    },

    /// A write job failed. Other queued writes are unaffected.
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The underlying read failed.
    #[error("Error reading from connection: errno: {}", .errno.unwrap_or(0))]
    Read {
        errno: Option<i32>,
        source: io::Error,
    },

    /// Binding or listening on the RFCOMM channel failed.
    #[error("Couldn't listen on bluetooth socket (channel {channel}): {source}")]
    Listen { channel: u8, source: io::Error },

    /// The service record could not be registered with the SDP daemon.
    #[error("Cannot register SDP record: {0}")]
    Advertise(String),

    /// The operation needs an open connection.
    #[error("The connection has been closed")]
    ConnectionClosed,

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Invalid RFCOMM channel {0}, expected 1..=30")]
    InvalidChannel(u8),

    #[error("The UUID is invalid: {0}")]
    InvalidUuid(String),

    /// The operation is not allowed in the current state.
    #[error("Operation not allowed while {0}")]
    InvalidState(&'static str),

    /// The background job was dropped before it reported a result.
    #[error("Background job ended without a result")]
    WorkerGone,
}

/// Per-job write failures.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Attempting to write to a closed connection")]
    Closed,

    /// The send loop stopped before the whole buffer went out.
    #[error("Writing attempt was unsuccessful ({written} of {requested} bytes sent)")]
    Unsuccessful {
        written: usize,
        requested: usize,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    /// Bytes that reached the socket before the job failed.
    pub fn written(&self) -> usize {
        match self {
            WriteError::Closed => 0,
            WriteError::Unsuccessful { written, .. } => *written,
        }
    }
}

fn describe_status(code: &Option<i32>, source: &io::Error) -> String {
    match code {
        Some(code) => code.to_string(),
        None => source.to_string(),
    }
}

impl Error {
    pub(crate) fn connect(source: io::Error) -> Self {
        Error::Connect {
            code: source.raw_os_error(),
            source,
        }
    }

    pub(crate) fn read(source: io::Error) -> Self {
        Error::Read {
            errno: source.raw_os_error(),
            source,
        }
    }

    /// Whether this is a read failure caused by the peer going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Read { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
