// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Remote transport seam.
//!
//! Every public module can be constructed either against the local machine
//! or against a [`Communicator`], in which case each read and mutation
//! becomes one request/response round-trip to a remote agent. The transport
//! itself (sockets, framing) lives outside this library; here we define the
//! channel contract, the message-id namespace, the typed payloads and the
//! agent-side dispatcher.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cpufreq::CpuFreq;
use crate::energy::Energy;
use crate::topology::Topology;
use crate::{Error, Result};

/// A half-duplex request/response channel.
///
/// Implementations must guarantee at most one in-flight message per channel
/// (a single channel lock around the send/receive pair). The library never
/// retries: any channel failure surfaces as [`Error::Transport`].
pub trait Communicator: Send + Sync {
    /// Sends `(message_id, payload)` and blocks for the response.
    fn round_trip(&self, message_id: &str, payload: &[u8]) -> Result<(String, Vec<u8>)>;
}

/// Message ids, of shape `wattfarm.<module>.<type>`.
pub mod msg {
    pub const TOPOLOGY_REQUEST: &str = "wattfarm.topology.request";
    pub const TOPOLOGY_RESPONSE: &str = "wattfarm.topology.response";
    pub const CPUFREQ_REQUEST: &str = "wattfarm.cpufreq.request";
    pub const CPUFREQ_RESPONSE: &str = "wattfarm.cpufreq.response";
    pub const ENERGY_REQUEST: &str = "wattfarm.energy.request";
    pub const ENERGY_RESPONSE: &str = "wattfarm.energy.response";
}

/// Error kinds that survive the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireError {
    Unsupported(String),
    InvalidArgument(String),
    NotFound(String),
    Fatal(String),
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Unsupported(m) => WireError::Unsupported(m.clone()),
            Error::InvalidArgument(m) => WireError::InvalidArgument(m.clone()),
            Error::NotFound(m) => WireError::NotFound(m.clone()),
            other => WireError::Fatal(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Unsupported(m) => Error::Unsupported(m),
            WireError::InvalidArgument(m) => Error::InvalidArgument(m),
            WireError::NotFound(m) => Error::NotFound(m),
            WireError::Fatal(m) => Error::Fatal(m),
        }
    }
}

/// Client side of one module call: serialize, round-trip, check the
/// response id, deserialize.
pub(crate) fn call<Req, Resp>(
    comm: &dyn Communicator,
    request_id: &str,
    response_id: &str,
    req: &Req,
) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(req)
        .map_err(|e| Error::Transport(format!("failed to encode {}: {}", request_id, e)))?;
    let (resp_id, resp_payload) = comm.round_trip(request_id, &payload)?;
    if resp_id != response_id {
        return Err(Error::Transport(format!(
            "expected {} in response to {}, got {}",
            response_id, request_id, resp_id
        )));
    }
    let wire: std::result::Result<Resp, WireError> = serde_json::from_slice(&resp_payload)
        .map_err(|e| Error::Transport(format!("failed to decode {}: {}", resp_id, e)))?;
    wire.map_err(Error::from)
}

/// The local modules a remote agent serves.
pub struct Agent {
    topology: Arc<Topology>,
    cpufreq: Arc<CpuFreq>,
    energy: Arc<Energy>,
}

impl Agent {
    pub fn new(topology: Arc<Topology>, cpufreq: Arc<CpuFreq>, energy: Arc<Energy>) -> Self {
        Self {
            topology,
            cpufreq,
            energy,
        }
    }

    /// Handles one incoming message and produces `(message_id, payload)`
    /// for the response. Messages whose id does not resolve to a known
    /// module are rejected.
    pub fn dispatch(&self, message_id: &str, payload: &[u8]) -> Result<(String, Vec<u8>)> {
        match message_id {
            msg::TOPOLOGY_REQUEST => {
                let req = decode(message_id, payload)?;
                let resp = self.topology.handle_request(req);
                encode(msg::TOPOLOGY_RESPONSE, resp)
            }
            msg::CPUFREQ_REQUEST => {
                let req = decode(message_id, payload)?;
                let resp = self.cpufreq.handle_request(req);
                encode(msg::CPUFREQ_RESPONSE, resp)
            }
            msg::ENERGY_REQUEST => {
                let req = decode(message_id, payload)?;
                let resp = self.energy.handle_request(req);
                encode(msg::ENERGY_RESPONSE, resp)
            }
            other => Err(Error::NotFound(format!(
                "message id {:?} does not resolve to a known module",
                other
            ))),
        }
    }
}

fn decode<Req: DeserializeOwned>(message_id: &str, payload: &[u8]) -> Result<Req> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Transport(format!("malformed {} payload: {}", message_id, e)))
}

fn encode<Resp: Serialize>(response_id: &str, resp: Result<Resp>) -> Result<(String, Vec<u8>)> {
    let wire: std::result::Result<Resp, WireError> = resp.map_err(|e| WireError::from(&e));
    let payload = serde_json::to_vec(&wire)
        .map_err(|e| Error::Transport(format!("failed to encode {}: {}", response_id, e)))?;
    Ok((response_id.to_string(), payload))
}
