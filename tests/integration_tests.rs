//! Integration tests for the session server and client
//!
//! Every test starts a real server on ephemeral ports and talks to it over
//! TCP, either through the client library or through a raw socket.

use client::{Client, ClientConfig, ClientError};
use server::config::{ServerConfig, UnknownPacketPolicy};
use server::network::{Server, ServerContext, ServerError, ServerHandle};
use server::sequencer::PartitionLogs;
use server::world::WorldStore;
use shared::disconnect::decode_disconnect;
use shared::framing::{read_frame, write_frame};
use shared::packets::{
    encode_message, split_packet, ChannelHello, CommandRequest, Hello, PacketId,
};
use shared::{CommandType, DeliveryMarker, DisconnectReason, GLOBAL, PROTOCOL_VERSION, VERSION};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    handle: ServerHandle,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig, world: WorldStore) -> Self {
        let server = Server::bind(config, world, PartitionLogs::new())
            .await
            .expect("server should bind");
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        Self { handle, task }
    }

    async fn start_default() -> Self {
        Self::start(config(), WorldStore::new(vec![7; 1024], vec![1, 2, 3])).await
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        self.handle.channel_addrs().to_vec()
    }

    async fn connect(&self, username: &str) -> Result<Client, ClientError> {
        Client::connect(ClientConfig::with_addrs(self.addrs(), username)).await
    }

    async fn join(&self, username: &str) -> Client {
        let mut client = self.connect(username).await.expect("client should connect");
        client.wait_playing(TIMEOUT).await.expect("client should join");
        client
    }

    /// Runs `query` on the tick thread and returns its result
    async fn query<T, F>(&self, query: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut ServerContext) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.handle.enqueue(move |ctx| {
            let _ = tx.send(query(ctx));
            Ok(())
        });
        tokio::time::timeout(TIMEOUT, rx)
            .await
            .expect("tick loop should answer")
            .expect("query should run")
    }

    async fn stop(self) {
        self.handle.stop();
        let result = tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("server should stop")
            .expect("server task should not panic");
        assert!(result.is_ok());
    }
}

fn config() -> ServerConfig {
    ServerConfig {
        port: 0,
        parallelism: 3,
        host_username: Some("host".to_string()),
        ..ServerConfig::default()
    }
}

fn has_command(client: &Client, command_type: CommandType) -> bool {
    client
        .session()
        .commands()
        .iter()
        .any(|r| r.command.command_type == command_type)
}

async fn raw_primary(addr: SocketAddr, nonce: u64) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = bincode::serialize(&ChannelHello { nonce, channel: 0 }).unwrap();
    write_frame(&mut stream, &hello).await.unwrap();
    stream
}

async fn read_packet(stream: &mut TcpStream) -> Option<(PacketId, Vec<u8>)> {
    let frame = tokio::time::timeout(TIMEOUT, read_frame(stream))
        .await
        .expect("server should answer")
        .unwrap()?;
    let (id, body) = split_packet(&frame).unwrap();
    Some((id, body.to_vec()))
}

fn hello(username: &str) -> Vec<u8> {
    let hello = Hello {
        protocol: PROTOCOL_VERSION,
        version: VERSION.to_string(),
        username: username.to_string(),
    };
    encode_message(PacketId::ClientHello, &hello).unwrap()
}

/// JOINING
mod join_tests {
    use super::*;

    #[tokio::test]
    async fn client_downloads_striped_world() {
        let world: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let server = TestServer::start(config(), WorldStore::new(world.clone(), vec![9])).await;

        let alice = server.join("alice").await;
        let loaded = alice.session().world().unwrap();
        assert_eq!(loaded.world, world);
        assert_eq!(loaded.session, vec![9]);
        assert_eq!(loaded.faction_id, 1);
        assert_eq!(alice.session().player_id, Some(0));

        assert_eq!(server.handle.playing_usernames(), vec!["alice".to_string()]);
        server.stop().await;
    }

    #[tokio::test]
    async fn late_joiner_receives_logged_commands() {
        let server = TestServer::start_default().await;

        let mut alice = server.join("alice").await;
        alice
            .send_command(CommandType::Designator, 0, vec![1, 2, 3])
            .unwrap();
        alice
            .wait_until("own command", TIMEOUT, |c| {
                has_command(c, CommandType::Designator)
            })
            .await
            .unwrap();

        let mut bob = server.join("bob").await;
        bob.wait_until("player list", TIMEOUT, |c| c.session().players().count() == 2)
            .await
            .unwrap();
        let logs = &bob.session().world().unwrap().logs;
        assert_eq!(logs[&0].len(), 1);
        assert_eq!(logs[&0][0].payload, vec![1, 2, 3]);
        assert_eq!(logs[&0][0].faction_id, 1);
        assert_eq!(logs[&GLOBAL][0].command_type, CommandType::FactionOnline);

        // Both players know about each other
        let names: Vec<String> = bob
            .session()
            .players()
            .map(|p| p.username.clone())
            .collect();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
        alice
            .wait_until("player list add", TIMEOUT, |c| c.session().players().count() == 2)
            .await
            .unwrap();

        server.stop().await;
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let server = TestServer::start_default().await;
        let _alice = server.join("alice").await;

        let mut impostor = server.connect("alice").await.unwrap();
        let result = impostor.wait_playing(TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::Disconnected(_))));
        assert_eq!(
            impostor.session().disconnect().unwrap().0,
            DisconnectReason::UsernameAlreadyOnline
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn protocol_mismatch_is_reported() {
        let server = TestServer::start_default().await;

        let mut config = ClientConfig::with_addrs(server.addrs(), "alice");
        config.protocol = PROTOCOL_VERSION + 1;
        let mut client = Client::connect(config).await.unwrap();
        assert!(client.wait_playing(TIMEOUT).await.is_err());

        let (reason, message) = client.session().disconnect().unwrap();
        assert_eq!(reason, DisconnectReason::Protocol);
        assert!(message.starts_with("Protocol mismatch: server runs version"));

        server.stop().await;
    }

    #[tokio::test]
    async fn full_server_rejects_join() {
        let config = ServerConfig {
            max_players: 1,
            ..config()
        };
        let server = TestServer::start(config, WorldStore::default()).await;
        let _alice = server.join("alice").await;

        let mut bob = server.connect("bob").await.unwrap();
        assert!(bob.wait_playing(TIMEOUT).await.is_err());
        assert_eq!(
            bob.session().disconnect().unwrap().0,
            DisconnectReason::ServerFull
        );

        server.stop().await;
    }
}

/// COMMAND STREAM
mod command_tests {
    use super::*;

    #[tokio::test]
    async fn commands_carry_self_and_remote_markers() {
        let server = TestServer::start_default().await;
        let mut alice = server.join("alice").await;
        let mut bob = server.join("bob").await;

        alice
            .send_command(CommandType::Designator, 4, vec![42])
            .unwrap();

        for client in [&mut alice, &mut bob] {
            client
                .wait_until("designator", TIMEOUT, |c| {
                    has_command(c, CommandType::Designator)
                })
                .await
                .unwrap();
        }

        let marker_of = |client: &Client| {
            client
                .session()
                .commands()
                .iter()
                .find(|r| r.command.command_type == CommandType::Designator)
                .map(|r| (r.marker, r.command.partition_id, r.command.payload.clone()))
                .unwrap()
        };
        assert_eq!(marker_of(&alice), (DeliveryMarker::SelfIssued, 4, vec![42]));
        assert_eq!(marker_of(&bob), (DeliveryMarker::Remote, 4, vec![42]));

        server.stop().await;
    }

    fn partition_payloads(client: &Client, partition_id: i32) -> Vec<Vec<u8>> {
        client
            .session()
            .commands()
            .iter()
            .filter(|r| r.command.partition_id == partition_id)
            .map(|r| r.command.payload.clone())
            .collect()
    }

    #[tokio::test]
    async fn mixed_size_commands_follow_server_log_order() {
        let config = ServerConfig {
            striping_threshold: 256,
            ..config()
        };
        let server = TestServer::start(config, WorldStore::default()).await;
        let mut alice = server.join("alice").await;
        let mut bob = server.join("bob").await;

        // Every third command is well above the striping threshold
        for round in 0..12u8 {
            let size = if round % 3 == 0 { 8192 } else { 1 };
            alice
                .send_command(CommandType::Designator, 3, vec![round; size])
                .unwrap();
            bob.send_command(CommandType::Designator, 3, vec![100 + round; size])
                .unwrap();
        }

        for client in [&mut alice, &mut bob] {
            client
                .wait_until("all commands", TIMEOUT, |c| {
                    partition_payloads(c, 3).len() == 24
                })
                .await
                .unwrap();
        }

        let log: Vec<Vec<u8>> = server
            .query(|ctx| {
                ctx.sequencer
                    .decoded_log(3)
                    .unwrap()
                    .into_iter()
                    .map(|c| c.payload)
                    .collect()
            })
            .await;
        assert_eq!(log.len(), 24);
        assert_eq!(partition_payloads(&alice, 3), log);
        assert_eq!(partition_payloads(&bob, 3), log);

        // Each issuer's own commands keep their send order
        let alice_rounds: Vec<u8> = log.iter().map(|p| p[0]).filter(|b| *b < 100).collect();
        assert_eq!(alice_rounds, (0..12).collect::<Vec<u8>>());

        server.stop().await;
    }

    #[tokio::test]
    async fn server_only_command_disconnects_sender() {
        let server = TestServer::start_default().await;
        let mut alice = server.join("alice").await;

        alice
            .send_command(CommandType::Autosave, GLOBAL, Vec::new())
            .unwrap();
        alice
            .wait_until("disconnect", TIMEOUT, |c| c.is_disconnected())
            .await
            .unwrap();
        assert_eq!(
            alice.session().disconnect().unwrap().0,
            DisconnectReason::Internal
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn faction_goes_offline_with_its_last_player() {
        let server = TestServer::start_default().await;
        server
            .query(|ctx| ctx.directory.write().set_faction("carol", 2))
            .await;

        let mut alice = server.join("alice").await;
        let mut carol = server.join("carol").await;
        assert_eq!(carol.session().faction_id, Some(2));

        carol.leave().await;
        alice
            .wait_until("faction offline", TIMEOUT, |c| {
                has_command(c, CommandType::FactionOffline)
                    && c.session()
                        .notifications()
                        .iter()
                        .any(|n| n.key == "PlayerDisconnected")
            })
            .await
            .unwrap();

        let session = alice.session();
        let payloads: Vec<(CommandType, Vec<u8>)> = session
            .commands()
            .iter()
            .filter(|r| r.command.partition_id == GLOBAL)
            .map(|r| (r.command.command_type, r.command.payload.clone()))
            .collect();
        assert_eq!(
            payloads,
            vec![
                (CommandType::FactionOnline, 1i32.to_le_bytes().to_vec()),
                (CommandType::FactionOnline, 2i32.to_le_bytes().to_vec()),
                (CommandType::FactionOffline, 2i32.to_le_bytes().to_vec()),
            ]
        );
        assert!(session
            .notifications()
            .iter()
            .any(|n| n.key == "PlayerDisconnected" && n.args == vec!["carol".to_string()]));

        server.stop().await;
    }

    #[tokio::test]
    async fn id_blocks_are_disjoint() {
        let server = TestServer::start_default().await;
        let mut alice = server.join("alice").await;

        alice.request_id_block(0).unwrap();
        alice.request_id_block(3).unwrap();
        alice
            .wait_until("id blocks", TIMEOUT, |c| c.session().id_blocks().len() == 2)
            .await
            .unwrap();

        let blocks = alice.session().id_blocks();
        assert_eq!((blocks[0].block_start, blocks[0].partition_id), (0, 0));
        assert_eq!((blocks[1].block_start, blocks[1].partition_id), (30000, 3));

        server.stop().await;
    }

    #[tokio::test]
    async fn autosave_replaces_world_and_trims_logs() {
        let server = TestServer::start_default().await;
        let mut host = server.join("host").await;

        server.handle.autosave();
        host.wait_until("autosave", TIMEOUT, |c| has_command(c, CommandType::Autosave))
            .await
            .unwrap();

        let mut partitions = BTreeMap::new();
        partitions.insert(0, vec![5, 5]);
        host.upload_world(&[8, 8, 8], &[6], &partitions).unwrap();

        let mut saved = false;
        for _ in 0..100 {
            saved = server
                .query(|ctx| !ctx.sequencer.is_capturing() && ctx.world.world() == [8, 8, 8])
                .await;
            if saved {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saved);

        let guest = server.join("guest").await;
        let world = guest.session().world().unwrap();
        assert_eq!(world.world, vec![8, 8, 8]);
        assert_eq!(world.partitions[&0], vec![5, 5]);
        assert_eq!(world.command_count(), 0);

        server.stop().await;
    }
}

/// CONNECTION HANDLING
mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn packet_before_handshake_disconnects() {
        let server = TestServer::start_default().await;
        let mut stream = raw_primary(server.addrs()[0], 11).await;

        let request = CommandRequest {
            command_type: CommandType::Designator as u8,
            partition_id: 0,
            payload: vec![],
        };
        let packet = encode_message(PacketId::ClientCommand, &request).unwrap();
        write_frame(&mut stream, &packet).await.unwrap();

        let (id, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(id, PacketId::ServerDisconnectReason);
        let (reason, data) = decode_disconnect(&body).unwrap();
        assert_eq!(reason, DisconnectReason::Internal);
        assert!(String::from_utf8_lossy(&data).contains("ClientCommand"));
        assert!(read_packet(&mut stream).await.is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn drop_policy_keeps_connection() {
        let config = ServerConfig {
            unknown_packet_policy: UnknownPacketPolicy::Drop,
            ..config()
        };
        let server = TestServer::start(config, WorldStore::default()).await;
        let mut stream = raw_primary(server.addrs()[0], 12).await;

        let request = CommandRequest {
            command_type: CommandType::Designator as u8,
            partition_id: 0,
            payload: vec![],
        };
        let packet = encode_message(PacketId::ClientCommand, &request).unwrap();
        write_frame(&mut stream, &packet).await.unwrap();
        write_frame(&mut stream, &hello("raw")).await.unwrap();

        let (id, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(id, PacketId::ServerJoinAccepted);
        let (id, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(id, PacketId::ServerWorldDataStart);

        server.stop().await;
    }

    #[tokio::test]
    async fn keep_alive_is_answered() {
        let config = ServerConfig {
            keep_alive_interval: 6,
            ..config()
        };
        let server = TestServer::start(config, WorldStore::default()).await;
        let mut alice = server.join("alice").await;

        alice
            .wait_until("second keepalive", TIMEOUT, |c| {
                c.session().last_keep_alive >= Some(2)
            })
            .await
            .unwrap();
        assert!(!alice.is_disconnected());
        assert_eq!(server.handle.connection_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn kick_removes_player() {
        let server = TestServer::start_default().await;
        let mut alice = server.join("alice").await;

        server.handle.kick("alice");
        alice
            .wait_until("kick", TIMEOUT, |c| c.is_disconnected())
            .await
            .unwrap();
        assert_eq!(alice.session().disconnect().unwrap().0, DisconnectReason::Kick);

        server.stop().await;
    }

    #[tokio::test]
    async fn shutdown_sends_server_closed() {
        let server = TestServer::start_default().await;
        let mut alice = server.join("alice").await;
        let mut bob = server.join("bob").await;

        server.stop().await;

        for client in [&mut alice, &mut bob] {
            client
                .wait_until("server closed", TIMEOUT, |c| c.is_disconnected())
                .await
                .unwrap();
            assert_eq!(
                client.session().disconnect().unwrap().0,
                DisconnectReason::ServerClosed
            );
        }
    }
}
