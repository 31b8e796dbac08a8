/*
src/discovery/message.rs

Discovery datagrams are short ASCII strings with semicolon-separated fields,
classified by the first field:

    DISCOVER_P2P;<msg-id>;<ttl>;<origin-ip>;<origin-port>
    P2P_FILE_SHARING;<msg-id>;<ttl>;<responder-ip>;<responder-port>
    P2P_HEARTBEAT;<sender-ip>;<sender-port>

The msg-id is a random 128-bit identifier in hyphenated hex form (a v4
UUID). Requests flood with a decrementing TTL; the id is what keeps the
flood loop-free.
*/

use crate::error::{ShareError, ShareResult};
use crate::peer::PeerAddr;

pub const REQUEST_TAG: &str = "DISCOVER_P2P";
pub const RESPONSE_TAG: &str = "P2P_FILE_SHARING";
pub const HEARTBEAT_TAG: &str = "P2P_HEARTBEAT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// A node looking for peers. `origin` is the requester, preserved
    /// verbatim across forwards.
    Request {
        msg_id: String,
        ttl: u32,
        origin: PeerAddr,
    },
    /// Direct answer to a request, advertising the responder.
    Response {
        msg_id: String,
        ttl: u32,
        responder: PeerAddr,
    },
    /// Periodic liveness signal.
    Heartbeat { sender: PeerAddr },
}

impl DiscoveryMessage {
    /// The peer address this message advertises, whatever its type.
    pub fn advertised(&self) -> &PeerAddr {
        match self {
            DiscoveryMessage::Request { origin, .. } => origin,
            DiscoveryMessage::Response { responder, .. } => responder,
            DiscoveryMessage::Heartbeat { sender } => sender,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            DiscoveryMessage::Request {
                msg_id,
                ttl,
                origin,
            } => format!(
                "{};{};{};{};{}",
                REQUEST_TAG, msg_id, ttl, origin.host, origin.port
            ),
            DiscoveryMessage::Response {
                msg_id,
                ttl,
                responder,
            } => format!(
                "{};{};{};{};{}",
                RESPONSE_TAG, msg_id, ttl, responder.host, responder.port
            ),
            DiscoveryMessage::Heartbeat { sender } => {
                format!("{};{};{}", HEARTBEAT_TAG, sender.host, sender.port)
            }
        }
    }

    pub fn parse(raw: &str) -> ShareResult<DiscoveryMessage> {
        let fields: Vec<&str> = raw.trim_end().split(';').collect();
        match fields[0] {
            REQUEST_TAG | RESPONSE_TAG => {
                if fields.len() != 5 {
                    return Err(ShareError::MalformedDatagram(format!(
                        "{} with {} fields",
                        fields[0],
                        fields.len()
                    )));
                }
                let msg_id = fields[1].to_string();
                let ttl: u32 = fields[2].parse()?;
                let addr: PeerAddr = format!("{}:{}", fields[3], fields[4]).parse()?;
                if fields[0] == REQUEST_TAG {
                    Ok(DiscoveryMessage::Request {
                        msg_id,
                        ttl,
                        origin: addr,
                    })
                } else {
                    Ok(DiscoveryMessage::Response {
                        msg_id,
                        ttl,
                        responder: addr,
                    })
                }
            }
            HEARTBEAT_TAG => {
                if fields.len() != 3 {
                    return Err(ShareError::MalformedDatagram(format!(
                        "heartbeat with {} fields",
                        fields.len()
                    )));
                }
                let sender: PeerAddr = format!("{}:{}", fields[1], fields[2]).parse()?;
                Ok(DiscoveryMessage::Heartbeat { sender })
            }
            other => Err(ShareError::MalformedDatagram(format!(
                "unknown tag {:?}",
                other
            ))),
        }
    }
}

/// Fresh random message id in hyphenated hex form.
pub fn new_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
