use crate::session::{PeerInfo, SessionSettings};
use crate::transfer::TransferSettings;
use courier::net::manager::ManagerSettings;
use courier::net::support::NetworkResult;
use flux::PlayerId;
use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28008;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub bind: SocketAddr,
    /// Port discovery broadcasts are sent to.
    pub broadcast_port: u16,
    pub connections: ManagerSettings,
}

/// A peer to connect to on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: PlayerId,
    pub name: String,
    /// Socket address (`ip:port`) or loopback node (`node:N`).
    pub address: String,
}

impl PeerConfig {
    #[inline]
    pub fn info(&self) -> NetworkResult<PeerInfo> {
        Ok(PeerInfo {
            id: self.id,
            name: self.name.clone(),
            address: self.address.parse()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub network: Network,
    pub session: SessionSettings,
    pub transfer: TransferSettings,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for GameConfig {
    fn default() -> GameConfig {
        GameConfig {
            network: Network {
                bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
                broadcast_port: DEFAULT_PORT,
                connections: ManagerSettings::default(),
            },
            session: SessionSettings::default(),
            transfer: TransferSettings::default(),
            peers: Vec::new(),
        }
    }
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<GameConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// Peers listed in the configuration, failing on the first unparseable address.
    pub fn peer_infos(&self) -> NetworkResult<Vec<PeerInfo>> {
        self.peers.iter().map(PeerConfig::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GameType;
    use courier::net::address::Address;

    #[test]
    fn test_default_roundtrip() {
        let toml = serdeconv::to_toml_string(&GameConfig::default()).unwrap();
        let config: GameConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(config.network.bind.port(), DEFAULT_PORT);
        assert_eq!(config.network.connections, ManagerSettings::default());
        assert_eq!(config.session.game_type, GameType::Lan);
        assert_eq!(config.transfer.response_timeout, TransferSettings::default().response_timeout);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_peers() {
        let mut config = GameConfig::default();
        config.peers.push(PeerConfig {
            id: 2,
            name: "tanya".to_owned(),
            address: "127.0.0.1:28009".to_owned(),
        });
        config.peers.push(PeerConfig {
            id: 3,
            name: "volkov".to_owned(),
            address: "node:7".to_owned(),
        });

        let peers = config.peer_infos().unwrap();

        assert_eq!(peers[0].address, Address::Socket("127.0.0.1:28009".parse().unwrap()));
        assert_eq!(peers[1].address, Address::Node(7));
        assert_eq!(peers[1].name, "volkov");
    }

    #[test]
    fn test_bad_peer_address() {
        let mut config = GameConfig::default();
        config.peers.push(PeerConfig {
            id: 2,
            name: "tanya".to_owned(),
            address: "somewhere".to_owned(),
        });

        assert!(config.peer_infos().is_err());
    }
}
