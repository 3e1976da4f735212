use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use qbft_rs::{
    networking::{Message, Network},
    qbft::messages::DecidedMessage,
    types::data_types::OperatorID,
};

/// A mock network stub which passes messages between operators using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_id: OperatorID,
    all_peers: Arc<Mutex<BTreeMap<OperatorID, Sender<(OperatorID, Message)>>>>,
    inbox: Arc<Mutex<Receiver<(OperatorID, Message)>>>,
}

impl NetworkStub {
    pub(crate) fn recv(&self) -> Option<(OperatorID, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }

    /// Take every message currently waiting in the inbox, in arrival order.
    pub(crate) fn drain(&self) -> Vec<(OperatorID, Message)> {
        std::iter::from_fn(|| self.recv()).collect()
    }

    fn send_to_others(&self, message: Message) {
        for (peer_id, peer) in self.all_peers.lock().unwrap().iter() {
            if *peer_id != self.my_id {
                let _ = peer.send((self.my_id, message.clone()));
            }
        }
    }
}

impl Network for NetworkStub {
    fn broadcast(&self, message: Message) {
        self.send_to_others(message)
    }

    fn broadcast_decided(&self, decided: DecidedMessage) {
        self.send_to_others(Message::Decided(decided))
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = OperatorID>) -> BTreeMap<OperatorID, NetworkStub> {
    let mut all_peers = BTreeMap::new();
    let peer_and_inboxes: Vec<(OperatorID, Receiver<(OperatorID, Message)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    let all_peers = Arc::new(Mutex::new(all_peers));
    peer_and_inboxes
        .into_iter()
        .map(|(my_id, inbox)| {
            let stub = NetworkStub {
                my_id,
                all_peers: all_peers.clone(),
                inbox: Arc::new(Mutex::new(inbox)),
            };
            (my_id, stub)
        })
        .collect()
}

/// A network that delivers nothing and remembers everything it was asked to send.
#[derive(Default)]
pub(crate) struct RecordingNetwork {
    pub(crate) sent: Mutex<Vec<Message>>,
    pub(crate) decided: Mutex<Vec<DecidedMessage>>,
}

impl RecordingNetwork {
    pub(crate) fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn decided(&self) -> Vec<DecidedMessage> {
        self.decided.lock().unwrap().clone()
    }
}

impl Network for RecordingNetwork {
    fn broadcast(&self, message: Message) {
        self.sent.lock().unwrap().push(message)
    }

    fn broadcast_decided(&self, decided: DecidedMessage) {
        self.decided.lock().unwrap().push(decided)
    }
}
