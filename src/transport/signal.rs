//! Signal envelopes: the metadata two peers exchange through the
//! signaling service to establish a direct media path. SDP and the full
//! ICE candidate set travel together in one compressed bundle, so a call
//! needs exactly one offer and one answer envelope plus an optional `Bye`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{CallError, RegistrationError};

/// SDP plus call metadata.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    pub call_id: String,
    pub ts: i64,
}

/// One ICE candidate, tagged with the call it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub call_id: String,
}

/// Everything the far side needs to negotiate: SDP and the complete
/// candidate set gathered for it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConnectionBundle {
    pub sdp_payload: SdpPayload,
    pub ice_candidates: Vec<IceCandidate>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Encoded [`ConnectionBundle`] opening a call.
    Offer { bundle: String },
    /// Encoded [`ConnectionBundle`] answering it, same `call_id`.
    Answer { bundle: String },
    /// The sender hung up.
    Bye { call_id: String },
}

/// An addressed signal message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    pub message: SignalMessage,
}

/// serde_json -> gzip -> base64, small enough for any signaling service.
pub fn encode_bundle(bundle: &ConnectionBundle) -> Result<String, CallError> {
    let json = serde_json::to_vec(bundle).map_err(|e| CallError::BadSignal(e.to_string()))?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| CallError::BadSignal(e.to_string()))?;
    let compressed = gz
        .finish()
        .map_err(|e| CallError::BadSignal(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_bundle(encoded: &str) -> Result<ConnectionBundle, CallError> {
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CallError::BadSignal(e.to_string()))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| CallError::BadSignal(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| CallError::BadSignal(e.to_string()))
}

/// The black-box link to the signaling service: announce an address, then
/// exchange envelopes with other registered addresses.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Register `address` and start receiving envelopes addressed to it.
    async fn open(
        &self,
        address: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, RegistrationError>;

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), CallError>;

    /// Withdraw the registration. Idempotent.
    async fn close(&self, address: &str);
}

const INBOX_BUFFER: usize = 32;

/// In-process signaling service: routes envelopes between addresses
/// registered on the same hub. Useful for tests and single-machine demos.
#[derive(Default, Clone)]
pub struct LoopbackSignalHub {
    inboxes: Arc<Mutex<HashMap<String, mpsc::Sender<SignalEnvelope>>>>,
}

impl LoopbackSignalHub {
    pub fn new() -> Self {
        LoopbackSignalHub::default()
    }

    pub fn registered(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .inboxes
            .lock()
            .expect("hub lock")
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        addresses
    }
}

#[async_trait]
impl SignalChannel for LoopbackSignalHub {
    async fn open(
        &self,
        address: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, RegistrationError> {
        let mut inboxes = self.inboxes.lock().expect("hub lock");
        if inboxes.contains_key(address) {
            return Err(RegistrationError::Rejected(address.to_string()));
        }
        let (tx, rx) = mpsc::channel(INBOX_BUFFER);
        inboxes.insert(address.to_string(), tx);
        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        let tx = {
            let inboxes = self.inboxes.lock().expect("hub lock");
            inboxes.get(&envelope.to).cloned()
        };
        match tx {
            Some(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| CallError::ConnectionClosed),
            None => Err(CallError::Negotiation {
                peer: envelope.to,
                reason: "address not registered".to_string(),
            }),
        }
    }

    async fn close(&self, address: &str) {
        self.inboxes.lock().expect("hub lock").remove(address);
    }
}
