//! TCP transport speaking the Dash P2P protocol.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashcore::bloom::BloomFilter;
use dashcore::consensus::{encode, Decodable};
use dashcore::hashes::Hash;
use dashcore::network::constants::{self, ServiceFlags};
use dashcore::network::message::{NetworkMessage, RawNetworkMessage, MAX_MSG_SIZE};
use dashcore::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage, Inventory};
use dashcore::network::message_bloom::FilterLoad;
use dashcore::network::message_network::VersionMessage;
use dashcore::{BlockHash, Network};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{NetworkError, NetworkResult};
use crate::network::{NetworkEvent, PeerInfo, PeerTransport};

/// Wire inventory type for a BIP37 filtered block.
const INV_TYPE_FILTERED_BLOCK: u32 = 3;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to one Dash peer over TCP.
///
/// Framing is the classic v1 envelope: 24-byte header (magic, command,
/// length, checksum) followed by the payload. A frame that decodes badly is
/// consumed and surfaced as [`NetworkEvent::Malformed`], so one bad message
/// does not desynchronize the stream.
pub struct TcpTransport {
    address: SocketAddr,
    network: Network,
    connect_timeout: Duration,
    user_agent: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(
        address: SocketAddr,
        network: Network,
        connect_timeout: Duration,
        user_agent: String,
    ) -> Self {
        Self {
            address,
            network,
            connect_timeout,
            user_agent,
            stream: None,
        }
    }

    async fn send_message(&mut self, message: NetworkMessage) -> NetworkResult<()> {
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;
        let raw = RawNetworkMessage {
            magic: self.network.magic(),
            payload: message,
        };
        let serialized = encode::serialize(&raw);
        stream.write_all(&serialized).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("Write to {} failed: {}", self.address, e))
        })?;
        tracing::trace!("Sent {} to {}", raw.payload.cmd(), self.address);
        Ok(())
    }

    /// Read one frame and decode it. The outer error is fatal for the
    /// connection; the inner error describes a consumed-but-undecodable frame.
    async fn read_message(&mut self) -> NetworkResult<Result<NetworkMessage, String>> {
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;

        let mut header = [0u8; 24];
        if let Err(e) = stream.read_exact(&mut header).await {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Err(NetworkError::PeerDisconnected)
            } else {
                Err(NetworkError::ConnectionFailed(format!(
                    "Read from {} failed: {}",
                    self.address, e
                )))
            };
        }

        let length = u32::from_le_bytes(header[16..20].try_into().expect("4 bytes")) as usize;
        if length > MAX_MSG_SIZE {
            // An oversized length field poisons framing for the rest of the
            // stream, so this one is fatal.
            return Err(NetworkError::ProtocolError(format!(
                "Oversized message from {}: {} bytes",
                self.address, length
            )));
        }

        let mut frame = Vec::with_capacity(24 + length);
        frame.extend_from_slice(&header);
        frame.resize(24 + length, 0);
        if let Err(e) = stream.read_exact(&mut frame[24..]).await {
            return Err(NetworkError::ConnectionFailed(format!(
                "Read from {} failed: {}",
                self.address, e
            )));
        }

        let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        if magic != self.network.magic() {
            return Ok(Err(format!(
                "wrong magic: expected {:#x}, got {:#x}",
                self.network.magic(),
                magic
            )));
        }

        let mut cursor = std::io::Cursor::new(&frame);
        match RawNetworkMessage::consensus_decode(&mut cursor) {
            Ok(raw) => {
                tracing::trace!("Received {} from {}", raw.payload.cmd(), self.address);
                Ok(Ok(raw.payload))
            }
            Err(e) => Ok(Err(format!("undecodable frame: {}", e))),
        }
    }

    fn build_version_message(&self) -> VersionMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs() as i64;
        let local_addr: SocketAddr =
            "0.0.0.0:0".parse().expect("static address parses");

        VersionMessage {
            version: constants::PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            timestamp,
            receiver: dashcore::network::address::Address::new(&self.address, ServiceFlags::NETWORK),
            sender: dashcore::network::address::Address::new(&local_addr, ServiceFlags::NONE),
            nonce: rand::random(),
            user_agent: self.user_agent.clone(),
            start_height: 0,
            // Suppress unfiltered tx relay; filterload switches on filtered relay.
            relay: false,
            mn_auth_challenge: [0; 32],
            masternode_connection: false,
        }
    }

    async fn perform_handshake(&mut self) -> NetworkResult<PeerInfo> {
        self.send_message(NetworkMessage::Version(self.build_version_message())).await?;

        let mut peer_info: Option<PeerInfo> = None;
        let mut verack_received = false;

        while peer_info.is_none() || !verack_received {
            match self.read_message().await? {
                Ok(NetworkMessage::Version(version)) => {
                    tracing::debug!(
                        "Peer {} is {} (protocol {}, height {})",
                        self.address,
                        version.user_agent,
                        version.version,
                        version.start_height
                    );
                    peer_info = Some(PeerInfo {
                        version: version.version,
                        services: version.services,
                        user_agent: version.user_agent,
                        start_height: version.start_height,
                    });
                    self.send_message(NetworkMessage::Verack).await?;
                }
                Ok(NetworkMessage::Verack) => {
                    verack_received = true;
                }
                Ok(NetworkMessage::Ping(nonce)) => {
                    self.send_message(NetworkMessage::Pong(nonce)).await?;
                }
                Ok(other) => {
                    tracing::debug!("Ignoring {} during handshake", other.cmd());
                }
                Err(desc) => {
                    return Err(NetworkError::HandshakeFailed(format!(
                        "Malformed message during handshake: {}",
                        desc
                    )));
                }
            }
        }

        Ok(peer_info.expect("loop exits only with peer info"))
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn connect(&mut self) -> NetworkResult<PeerInfo> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                ))
            })?;
        stream.set_nodelay(true).map_err(|e| {
            NetworkError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;
        self.stream = Some(stream);
        tracing::info!("Connected to peer {}", self.address);

        let info = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.perform_handshake())
            .await
            .map_err(|_| NetworkError::Timeout)??;
        tracing::info!("Handshake with {} complete", self.address);
        Ok(info)
    }

    async fn install_filter(&mut self, filter: &BloomFilter) -> NetworkResult<()> {
        let load = FilterLoad::from_bloom_filter(filter);
        self.send_message(NetworkMessage::FilterLoad(load)).await
    }

    async fn request_headers(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()> {
        let msg = GetHeadersMessage::new(locator, BlockHash::all_zeros());
        self.send_message(NetworkMessage::GetHeaders(msg)).await
    }

    async fn request_filtered_blocks(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()> {
        let msg = GetBlocksMessage::new(locator, BlockHash::all_zeros());
        self.send_message(NetworkMessage::GetBlocks(msg)).await
    }

    async fn request_mempool(&mut self) -> NetworkResult<()> {
        self.send_message(NetworkMessage::MemPool).await
    }

    async fn next_event(&mut self) -> NetworkResult<NetworkEvent> {
        loop {
            let message = match self.read_message().await {
                Ok(decoded) => decoded,
                Err(NetworkError::PeerDisconnected) => return Ok(NetworkEvent::Disconnected),
                Err(e) => return Err(e),
            };

            match message {
                Ok(NetworkMessage::Headers(headers)) => {
                    return Ok(NetworkEvent::Headers(headers));
                }
                Ok(NetworkMessage::MerkleBlock(merkle_block)) => {
                    let mut matched = Vec::new();
                    let mut indexes = Vec::new();
                    match merkle_block.extract_matches(&mut matched, &mut indexes) {
                        Ok(()) => {
                            return Ok(NetworkEvent::FilteredBlock {
                                header: merkle_block.header,
                                matched,
                            });
                        }
                        Err(e) => {
                            return Ok(NetworkEvent::Malformed(format!(
                                "merkleblock proof failed: {:?}",
                                e
                            )));
                        }
                    }
                }
                Ok(NetworkMessage::Tx(tx)) => {
                    return Ok(NetworkEvent::Transaction(tx));
                }
                Ok(NetworkMessage::Inv(items)) => {
                    // Fetch announced blocks as filtered blocks and announced
                    // transactions directly.
                    let wanted: Vec<Inventory> = items
                        .iter()
                        .filter_map(|item| match item {
                            Inventory::Block(hash) => Some(Inventory::Unknown {
                                inv_type: INV_TYPE_FILTERED_BLOCK,
                                hash: hash.to_byte_array(),
                            }),
                            Inventory::Transaction(txid) => {
                                Some(Inventory::Transaction(*txid))
                            }
                            _ => None,
                        })
                        .collect();
                    if !wanted.is_empty() {
                        self.send_message(NetworkMessage::GetData(wanted)).await?;
                    }
                }
                Ok(NetworkMessage::Ping(nonce)) => {
                    self.send_message(NetworkMessage::Pong(nonce)).await?;
                }
                Ok(other) => {
                    tracing::trace!("Ignoring {} from {}", other.cmd(), self.address);
                }
                Err(desc) => {
                    return Ok(NetworkEvent::Malformed(desc));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            tracing::info!("Disconnected from peer {}", self.address);
        }
    }
}
