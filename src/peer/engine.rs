use std::path::Path;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{PeerRow, peer_dir_name};
use crate::peer::LocalPeer;
use crate::peer::error::PeerError;
use crate::peer::neighbor::Neighbor;
use crate::peer::state::SharedState;
use crate::peer::store::PieceStore;
use crate::wire::handshake::Handshake;
use crate::wire::message::{Bitfield, Message, PeerMessage};
use crate::wire::{HANDSHAKE_LEN, WireError};

/// The protocol engine: owns the neighbor table, the piece store and the
/// choke scheduler, and drives one dispatcher task per live connection.
///
/// Cheap to clone; clones share all state.
pub struct PeerEngine {
    local: Arc<LocalPeer>,
    state: Arc<Mutex<SharedState>>,
    store: Arc<PieceStore>,
    shutdown: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    listen_port: Arc<OnceLock<u16>>,
}

impl PeerEngine {
    /// Builds the engine over `root/peer_<id>/<file_name>`. The local
    /// bitfield starts fully set when this peer claims the complete file,
    /// otherwise seeded by probing the store for pieces already on disk.
    pub async fn new(local: LocalPeer, has_file: bool, root: &Path) -> Result<Self, PeerError> {
        let dir = root.join(peer_dir_name(local.peer_id));
        let store =
            PieceStore::open(&dir, &local.file_name, local.file_size, local.piece_size).await?;

        let bitfield = if has_file {
            Bitfield::full(local.total_pieces())
        } else {
            store.probe_bitfield().await?
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            state: Arc::new(Mutex::new(SharedState::new(local.total_pieces(), bitfield))),
            store: Arc::new(store),
            local: Arc::new(local),
            shutdown,
            tasks: Arc::new(Mutex::new(Vec::new())),
            listen_port: Arc::new(OnceLock::new()),
        })
    }

    /// Binds the listen port and starts the accept loop and both scheduler
    /// timers. Failing to bind is the one fatal engine error.
    pub async fn start(&self) -> Result<u16, PeerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.local.port)).await?;
        let port = listener.local_addr()?.port();
        let _ = self.listen_port.set(port);
        info!(
            "peer {} listening for incoming connections on port {port}",
            self.local.peer_id
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        tasks.push(tokio::spawn(self.clone().unchoke_timer_loop()));
        tasks.push(tokio::spawn(self.clone().optimistic_unchoke_loop()));
        Ok(port)
    }

    /// Signals shutdown, closes every neighbor connection and joins all
    /// spawned tasks before returning.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        {
            let mut st = self.state.lock().await;
            let ids: Vec<u32> = st.neighbors.keys().copied().collect();
            for id in ids {
                st.remove_neighbor(id);
            }
        }

        // Late-accepted connections may still be pushing handles; drain
        // until the list stays empty.
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().await;
                tasks.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for task in drained {
                let _ = task.await;
            }
        }
        info!("peer {} stopped", self.local.peer_id);
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port.get().copied()
    }

    pub async fn has_complete_file(&self) -> bool {
        self.state.lock().await.has_complete_file()
    }

    pub async fn pieces_owned(&self) -> u32 {
        self.state.lock().await.pieces_owned()
    }

    /// Dials a configured neighbor, sends our handshake first, verifies the
    /// reply against the expected peer id and hands the connection to a
    /// dispatcher.
    pub async fn connect_to_peer(&self, row: &PeerRow) -> Result<(), PeerError> {
        let mut stream = TcpStream::connect((row.host.as_str(), row.port)).await?;
        debug!("connected to {}:{}", row.host, row.port);

        self.send_handshake(&mut stream).await?;
        let remote = self.read_handshake(&mut stream).await?;
        if remote.peer_id != row.id {
            return Err(PeerError::PeerIdMismatch {
                expected: row.id,
                actual: remote.peer_id,
            });
        }
        info!("received handshake from peer {}", remote.peer_id);

        self.register_and_dispatch(stream, row.id, row.has_file)
            .await
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.changed() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                },
            };

            debug!("accepted connection from {addr}");
            let engine = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = engine.handle_inbound(stream).await {
                    warn!("inbound connection from {addr} rejected: {e}");
                }
            });
            self.tasks.lock().await.push(handle);
        }
        info!("stopped listening for incoming connections");
    }

    /// Inbound side of the handshake: read and verify the remote's
    /// handshake, reply with our own, then register. Whether the remote
    /// holds the full file is unknown until its bitfield arrives.
    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<(), PeerError> {
        let remote = self.read_handshake(&mut stream).await?;
        self.send_handshake(&mut stream).await?;
        info!("received handshake from peer {}", remote.peer_id);

        self.register_and_dispatch(stream, remote.peer_id, false)
            .await
    }

    async fn send_handshake(&self, stream: &mut TcpStream) -> Result<(), PeerError> {
        let handshake = Handshake::new(self.local.peer_id);
        stream.write_all(&handshake.serialize()).await?;
        debug!("sent handshake");
        Ok(())
    }

    async fn read_handshake(&self, stream: &mut TcpStream) -> Result<Handshake, PeerError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        Ok(Handshake::deserialize(&buf)?)
    }

    /// Registers a handshaken connection as a Neighbor, queues our current
    /// bitfield as its first application message and starts its writer and
    /// dispatcher tasks. A duplicate peer id drops the connection.
    async fn register_and_dispatch(
        &self,
        stream: TcpStream,
        peer_id: u32,
        has_file: bool,
    ) -> Result<(), PeerError> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let neighbor = Neighbor::new(peer_id, addr, tx, self.local.total_pieces(), has_file);

        {
            let mut st = self.state.lock().await;
            st.register(neighbor)?;
            let bitfield = st.bitfield.clone();
            if let Some(n) = st.neighbors.get(&peer_id) {
                n.send_peer_message(PeerMessage::Bitfield(bitfield));
            }
        }
        info!("connected to peer {peer_id} at {addr}");

        let writer = tokio::spawn(writer_loop(rx, write_half, peer_id));
        let dispatcher = {
            let engine = self.clone();
            tokio::spawn(async move { engine.dispatch_loop(peer_id, read_half).await })
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(writer);
        tasks.push(dispatcher);
        Ok(())
    }

    /// Per-neighbor read loop: frame, type, dispatch, repeat. Any transport
    /// failure or protocol violation ends the loop, and the neighbor is
    /// deregistered with its outstanding requests released.
    async fn dispatch_loop(self, peer_id: u32, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                res = Message::read_from(&mut reader) => match res {
                    Ok(msg) => msg,
                    Err(WireError::Closed) => {
                        info!("peer {peer_id} closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("failed to read message from peer {peer_id}: {e}");
                        break;
                    }
                },
            };

            let typed = match PeerMessage::try_from(msg) {
                Ok(typed) => typed,
                Err(e) => {
                    error!("invalid message from peer {peer_id}: {e}");
                    break;
                }
            };

            if let Err(e) = self.handle_message(peer_id, typed).await {
                error!("dropping peer {peer_id}: {e}");
                break;
            }
        }
        self.teardown_neighbor(peer_id).await;
    }

    async fn teardown_neighbor(&self, peer_id: u32) {
        let mut st = self.state.lock().await;
        if st.remove_neighbor(peer_id).is_some() {
            info!("lost connection to peer {peer_id}");
        }
    }

    async fn handle_message(&self, peer_id: u32, msg: PeerMessage) -> Result<(), PeerError> {
        match msg {
            PeerMessage::Choke => {
                let mut st = self.state.lock().await;
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.peer_choking = true;
                }
                let released = st.release_requests_of(peer_id);
                info!("received 'choke' from peer {peer_id}");
                if !released.is_empty() {
                    debug!("released outstanding pieces {released:?} after choke");
                }
            }
            PeerMessage::Unchoke => {
                let mut st = self.state.lock().await;
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.peer_choking = false;
                }
                info!("received 'unchoke' from peer {peer_id}");
                self.request_next(&mut st, peer_id);
            }
            PeerMessage::Interested => {
                let mut st = self.state.lock().await;
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.peer_interested = true;
                }
                info!("received 'interested' from peer {peer_id}");
            }
            PeerMessage::NotInterested => {
                let mut st = self.state.lock().await;
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.peer_interested = false;
                }
                info!("received 'not interested' from peer {peer_id}");
            }
            PeerMessage::Have { index } => {
                self.check_index(index)?;
                let mut st = self.state.lock().await;
                let total = st.total_pieces;
                let we_have = st.has_piece(index);
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.record_have(index, total);
                    info!("received 'have' from peer {peer_id} for piece {index}");
                    if !we_have && !n.am_interested {
                        n.send_peer_message(PeerMessage::Interested);
                        n.am_interested = true;
                        info!("sent 'interested' to peer {peer_id}");
                    }
                }
            }
            PeerMessage::Bitfield(bits) => {
                let mut st = self.state.lock().await;
                let total = st.total_pieces;
                let local = st.bitfield.clone();
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    n.replace_bitfield(&bits.bits, total);
                    info!("received bitfield from peer {peer_id}");

                    let interesting = (0..total).any(|i| !local.has_piece(i) && n.has_piece(i));
                    if interesting {
                        n.send_peer_message(PeerMessage::Interested);
                        n.am_interested = true;
                        info!("sent 'interested' to peer {peer_id}");
                    } else {
                        n.send_peer_message(PeerMessage::NotInterested);
                        n.am_interested = false;
                        info!("sent 'not interested' to peer {peer_id}");
                    }
                }
            }
            PeerMessage::Request { index } => {
                self.check_index(index)?;
                let sender = {
                    let st = self.state.lock().await;
                    match st.neighbors.get(&peer_id) {
                        Some(n) if !n.am_choking => Some(n.sender()),
                        Some(_) => {
                            debug!("dropping request for piece {index} from choked peer {peer_id}");
                            None
                        }
                        None => None,
                    }
                };
                let Some(sender) = sender else {
                    return Ok(());
                };

                match self.store.read_piece(index).await {
                    Ok(data) => {
                        let _ = sender.send(Message::from(PeerMessage::Piece { index, data }));
                        debug!("sent piece {index} to peer {peer_id}");
                    }
                    Err(e) => {
                        error!("failed to read piece {index} for peer {peer_id}: {e}");
                    }
                }
            }
            PeerMessage::Piece { index, data } => {
                self.check_index(index)?;
                let expected = self.local.piece_len(index);
                if data.len() as u64 != expected {
                    return Err(PeerError::PieceLengthMismatch {
                        index,
                        expected,
                        actual: data.len(),
                    });
                }

                {
                    let st = self.state.lock().await;
                    if st.has_piece(index) {
                        warn!("received piece {index} we already have; ignoring");
                        return Ok(());
                    }
                }

                if let Err(e) = self.store.write_piece(index, &data).await {
                    error!("failed to write piece {index}: {e}");
                    // Leave the piece eligible for a retry from anyone.
                    self.state.lock().await.release_piece(index);
                    return Ok(());
                }

                let mut st = self.state.lock().await;
                st.complete_piece(index);
                info!(
                    "downloaded piece {index} from peer {peer_id}; now has {} of {} pieces",
                    st.pieces_owned(),
                    st.total_pieces
                );

                for n in st.neighbors.values() {
                    n.send_peer_message(PeerMessage::Have { index });
                }

                if st.has_complete_file() {
                    info!("downloaded the complete file");
                } else if st.neighbors.get(&peer_id).is_some_and(|n| !n.peer_choking) {
                    self.request_next(&mut st, peer_id);
                }
            }
        }
        Ok(())
    }

    /// Picks the first piece we lack that this neighbor has and nobody has
    /// been asked for, claims it in the ledger and queues the REQUEST — all
    /// inside the caller's critical section, so a piece can never end up
    /// requested from two neighbors.
    fn request_next(&self, st: &mut SharedState, peer_id: u32) {
        match st.next_wanted_piece(peer_id) {
            Some(index) => {
                st.claim_piece(index, peer_id);
                if let Some(n) = st.neighbors.get(&peer_id) {
                    n.send_peer_message(PeerMessage::Request { index });
                    debug!("requested piece {index} from peer {peer_id}");
                }
            }
            None => {
                if let Some(n) = st.neighbors.get_mut(&peer_id) {
                    if n.am_interested {
                        n.send_peer_message(PeerMessage::NotInterested);
                        n.am_interested = false;
                        info!("sent 'not interested' to peer {peer_id}");
                    }
                }
            }
        }
    }

    fn check_index(&self, index: u32) -> Result<(), PeerError> {
        if index >= self.local.total_pieces() {
            return Err(PeerError::PieceIndexOutOfRange(index));
        }
        Ok(())
    }

    /// Wholesale preferred-neighbor rotation on a fixed interval.
    async fn unchoke_timer_loop(self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.local.unchoke_interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let mut st = self.state.lock().await;
            let plan = st.select_preferred(self.local.preferred_neighbor_count);
            for id in &plan.unchoke {
                if let Some(n) = st.neighbors.get(id) {
                    n.send_peer_message(PeerMessage::Unchoke);
                    info!("unchoked neighbor {id}");
                }
            }
            for id in &plan.choke {
                if let Some(n) = st.neighbors.get(id) {
                    n.send_peer_message(PeerMessage::Choke);
                    info!("choked neighbor {id}");
                }
            }
            if !plan.unchoke.is_empty() || !plan.choke.is_empty() {
                info!("preferred neighbors are now {:?}", st.preferred_ids());
            }
        }
    }

    /// Periodically grants one extra interested, non-preferred neighbor an
    /// unchoke; the next rotation re-chokes it unless it gets selected.
    async fn optimistic_unchoke_loop(self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.local.optimistic_unchoke_interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let mut st = self.state.lock().await;
            if let Some(id) = st.pick_optimistic() {
                if let Some(n) = st.neighbors.get(&id) {
                    n.send_peer_message(PeerMessage::Unchoke);
                }
                info!("optimistically unchoked neighbor {id}");
            }
        }
    }
}

impl Clone for PeerEngine {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            shutdown: self.shutdown.clone(),
            tasks: Arc::clone(&self.tasks),
            listen_port: Arc::clone(&self.listen_port),
        }
    }
}

/// Drains one neighbor's outbox onto its socket. Exits when the neighbor is
/// deregistered (all senders dropped) or the socket dies; dropping the write
/// half closes the connection.
async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut writer: OwnedWriteHalf,
    peer_id: u32,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = msg.write_to(&mut writer).await {
            debug!("write to peer {peer_id} failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const FILE_SIZE: u64 = 128 * 1024;
    const PIECE_SIZE: u64 = 32 * 1024;

    fn seed_bytes(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn local(id: u32, interval: Duration) -> LocalPeer {
        LocalPeer {
            peer_id: id,
            host: "127.0.0.1".to_string(),
            port: 0, // OS-assigned, so tests never collide
            file_name: "TheFile.dat".to_string(),
            file_size: FILE_SIZE,
            piece_size: PIECE_SIZE,
            preferred_neighbor_count: 2,
            unchoke_interval: interval,
            optimistic_unchoke_interval: interval * 4,
        }
    }

    async fn engine_in(root: &TempDir, id: u32, has_file: bool, interval: Duration) -> PeerEngine {
        let dir = root.path().join(peer_dir_name(id));
        tokio::fs::create_dir(&dir).await.unwrap();
        if has_file {
            tokio::fs::write(dir.join("TheFile.dat"), seed_bytes(FILE_SIZE))
                .await
                .unwrap();
        }
        PeerEngine::new(local(id, interval), has_file, root.path())
            .await
            .unwrap()
    }

    /// Wires a fake neighbor straight into the table, returning the queue a
    /// real writer task would drain.
    async fn add_fake_neighbor(engine: &PeerEngine, id: u32) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = "127.0.0.1:1".parse().unwrap();
        let mut st = engine.state.lock().await;
        let total = st.total_pieces;
        st.register(Neighbor::new(id, addr, tx, total, false))
            .unwrap();
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<PeerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(PeerMessage::try_from(msg).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn seed_bitfield_starts_full_and_leech_empty() {
        let tmp = TempDir::new().unwrap();
        let seed = engine_in(&tmp, 1001, true, Duration::from_secs(60)).await;
        let leech = engine_in(&tmp, 1002, false, Duration::from_secs(60)).await;

        assert!(seed.has_complete_file().await);
        assert_eq!(seed.pieces_owned().await, 4);
        assert!(!leech.has_complete_file().await);
        assert_eq!(leech.pieces_owned().await, 0);
    }

    #[tokio::test]
    async fn partial_file_on_disk_seeds_bitfield() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(peer_dir_name(1003));
        tokio::fs::create_dir(&dir).await.unwrap();
        // Two full pieces already on disk from an earlier run.
        tokio::fs::write(dir.join("TheFile.dat"), seed_bytes(2 * PIECE_SIZE))
            .await
            .unwrap();

        let engine = PeerEngine::new(local(1003, Duration::from_secs(60)), false, tmp.path())
            .await
            .unwrap();
        assert_eq!(engine.pieces_owned().await, 2);
    }

    #[tokio::test]
    async fn unchoke_triggers_request_and_choke_releases_it() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_in(&tmp, 1001, false, Duration::from_secs(60)).await;
        let mut rx_a = add_fake_neighbor(&engine, 1002).await;
        let mut rx_b = add_fake_neighbor(&engine, 1003).await;
        for id in [1002, 1003] {
            engine
                .state
                .lock()
                .await
                .neighbors
                .get_mut(&id)
                .unwrap()
                .replace_bitfield(&[0xF0], 4);
        }

        // Neighbor A unchokes us: piece 0 is claimed and requested from A.
        engine
            .handle_message(1002, PeerMessage::Unchoke)
            .await
            .unwrap();
        {
            let st = engine.state.lock().await;
            assert!(st.is_requested(0));
            assert_eq!(st.owner_of(0), Some(1002));
        }
        assert_eq!(drain(&mut rx_a), vec![PeerMessage::Request { index: 0 }]);

        // B unchoking while 0 is outstanding picks the next piece instead.
        engine
            .handle_message(1003, PeerMessage::Unchoke)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx_b), vec![PeerMessage::Request { index: 1 }]);

        // A chokes us: its outstanding piece goes back to "unrequested"...
        engine
            .handle_message(1002, PeerMessage::Choke)
            .await
            .unwrap();
        {
            let st = engine.state.lock().await;
            assert!(!st.is_requested(0));
            assert!(st.is_requested(1));
        }

        // ...and B, already unchoked, picks it up on its next completion.
        let piece1 = seed_bytes(FILE_SIZE)[PIECE_SIZE as usize..2 * PIECE_SIZE as usize].to_vec();
        engine
            .handle_message(
                1003,
                PeerMessage::Piece {
                    index: 1,
                    data: piece1,
                },
            )
            .await
            .unwrap();
        {
            let st = engine.state.lock().await;
            assert!(st.has_piece(1));
            assert_eq!(st.owner_of(0), Some(1003));
        }
        let to_b = drain(&mut rx_b);
        assert!(to_b.contains(&PeerMessage::Have { index: 1 }));
        assert!(to_b.contains(&PeerMessage::Request { index: 0 }));
    }

    #[tokio::test]
    async fn duplicate_piece_is_ignored_without_rebroadcast() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_in(&tmp, 1001, false, Duration::from_secs(60)).await;
        let mut rx = add_fake_neighbor(&engine, 1002).await;

        let piece0 = vec![7u8; PIECE_SIZE as usize];
        engine.store.write_piece(0, &piece0).await.unwrap();
        engine.state.lock().await.complete_piece(0);

        // A stray duplicate with different content arrives.
        engine
            .handle_message(
                1002,
                PeerMessage::Piece {
                    index: 0,
                    data: vec![9u8; PIECE_SIZE as usize],
                },
            )
            .await
            .unwrap();

        // Stored bytes unchanged, nothing broadcast.
        assert_eq!(engine.store.read_piece(0).await.unwrap(), piece0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn wrong_length_piece_is_a_protocol_violation() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_in(&tmp, 1001, false, Duration::from_secs(60)).await;
        let _rx = add_fake_neighbor(&engine, 1002).await;

        let result = engine
            .handle_message(
                1002,
                PeerMessage::Piece {
                    index: 0,
                    data: vec![0u8; 10],
                },
            )
            .await;
        assert_matches!(result, Err(PeerError::PieceLengthMismatch { index: 0, .. }));
    }

    #[tokio::test]
    async fn have_for_missing_piece_declares_interest_once() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_in(&tmp, 1001, false, Duration::from_secs(60)).await;
        let mut rx = add_fake_neighbor(&engine, 1002).await;

        engine
            .handle_message(1002, PeerMessage::Have { index: 2 })
            .await
            .unwrap();
        engine
            .handle_message(1002, PeerMessage::Have { index: 3 })
            .await
            .unwrap();

        // One INTERESTED despite two interesting announcements.
        assert_eq!(drain(&mut rx), vec![PeerMessage::Interested]);
        let st = engine.state.lock().await;
        let n = &st.neighbors[&1002];
        assert!(n.am_interested);
        assert!(n.has_piece(2));
        assert!(n.has_piece(3));
    }

    #[tokio::test]
    async fn request_from_choked_neighbor_is_silently_dropped() {
        let tmp = TempDir::new().unwrap();
        let engine = engine_in(&tmp, 1001, true, Duration::from_secs(60)).await;
        let mut rx = add_fake_neighbor(&engine, 1002).await;

        // Default state: we are choking them.
        engine
            .handle_message(1002, PeerMessage::Request { index: 0 })
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        // After we unchoke them the same request is served.
        engine
            .state
            .lock()
            .await
            .neighbors
            .get_mut(&1002)
            .unwrap()
            .am_choking = false;
        engine
            .handle_message(1002, PeerMessage::Request { index: 0 })
            .await
            .unwrap();
        let sent = drain(&mut rx);
        assert_matches!(
            sent.as_slice(),
            [PeerMessage::Piece { index: 0, data }] if data.len() == PIECE_SIZE as usize
        );
    }

    #[tokio::test]
    async fn seed_to_leech_transfer_completes() {
        let tmp = TempDir::new().unwrap();
        let seed = engine_in(&tmp, 1001, true, Duration::from_millis(200)).await;
        let port = seed.start().await.unwrap();

        let leech = engine_in(&tmp, 1002, false, Duration::from_millis(200)).await;
        leech.start().await.unwrap();
        leech
            .connect_to_peer(&PeerRow {
                id: 1001,
                host: "127.0.0.1".to_string(),
                port,
                has_file: true,
            })
            .await
            .unwrap();

        timeout(Duration::from_secs(20), async {
            while !leech.has_complete_file().await {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("download did not complete");

        let got = tokio::fs::read(tmp.path().join("peer_1002/TheFile.dat"))
            .await
            .unwrap();
        assert_eq!(got, seed_bytes(FILE_SIZE));

        leech.stop().await;
        seed.stop().await;
    }

    #[tokio::test]
    async fn out_of_range_request_tears_down_connection() {
        let tmp = TempDir::new().unwrap();
        let seed = engine_in(&tmp, 1001, true, Duration::from_secs(60)).await;
        let port = seed.start().await.unwrap();

        let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        sock.write_all(&Handshake::new(2002).serialize())
            .await
            .unwrap();

        let mut buf = [0u8; HANDSHAKE_LEN];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(Handshake::deserialize(&buf).unwrap().peer_id, 1001);

        // The seed announces its bitfield first.
        let first = Message::read_from(&mut sock).await.unwrap();
        assert_matches!(
            PeerMessage::try_from(first).unwrap(),
            PeerMessage::Bitfield(_)
        );

        Message::from(PeerMessage::Request { index: 99 })
            .write_to(&mut sock)
            .await
            .unwrap();

        // No PIECE ever arrives; the connection is simply closed on us.
        assert_matches!(
            Message::read_from(&mut sock).await,
            Err(WireError::Closed)
        );

        seed.stop().await;
    }

    #[tokio::test]
    async fn bad_handshake_is_rejected_before_registration() {
        let tmp = TempDir::new().unwrap();
        let seed = engine_in(&tmp, 1001, true, Duration::from_secs(60)).await;
        let port = seed.start().await.unwrap();

        let mut sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut bogus = Handshake::new(2002).serialize();
        bogus[20] = 0xFF; // reserved byte must be zero
        sock.write_all(&bogus).await.unwrap();

        // The socket is dropped without a handshake reply.
        let mut buf = [0u8; HANDSHAKE_LEN];
        assert!(sock.read_exact(&mut buf).await.is_err());
        assert!(seed.state.lock().await.neighbors.is_empty());

        seed.stop().await;
    }
}
