use std::path::Path;
use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use zcore_chainstate::blockindex::BlockStatus;
use zcore_chainstate::utxo::CoinsView;
use zcore_chainstate::{
    ChainState, ChainStateError, CheckQueue, ConsensusViolation, TemplateVerifier,
    ValidationFlags,
};
use zcore_consensus::{consensus_params, ConsensusParams, Hash256, Network};
use zcore_primitives::block::{merkle_root, Block, BlockHeader};
use zcore_primitives::hash::hash160;
use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::{Transaction, TxIn, TxOut};
use zcore_script::sighash::{signature_hash, SighashType, SigningInput, SIGHASH_ALL};
use zcore_script::standard::p2pkh_script;
use zcore_storage::memory::MemoryStore;

const BITS: u32 = 0x200f_0f0f;
const TIME: u32 = 1_700_000_000;

struct Key {
    secret: SecretKey,
    pubkey: [u8; 33],
}

impl Key {
    fn new(tag: u8) -> Self {
        let secret = SecretKey::from_slice(&[tag; 32]).expect("secret key");
        let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize();
        Self { secret, pubkey }
    }

    fn script(&self) -> Vec<u8> {
        p2pkh_script(&hash160(&self.pubkey))
    }

    /// Signs input `index` of `tx`, which spends an output locked to this key.
    fn sign(&self, tx: &mut Transaction, index: usize, amount: i64) {
        let script_code = self.script();
        let sighash = signature_hash(
            tx,
            Some(SigningInput {
                index,
                script_code: &script_code,
                amount,
            }),
            SighashType(SIGHASH_ALL),
            0,
        )
        .expect("sighash");
        let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(sighash), &self.secret);
        let mut der = sig.serialize_der().to_vec();
        der.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::new();
        script_sig.push(der.len() as u8);
        script_sig.extend_from_slice(&der);
        script_sig.push(self.pubkey.len() as u8);
        script_sig.extend_from_slice(&self.pubkey);
        tx.vin[index].script_sig = script_sig;
    }
}

fn coinbase_tx(height: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    let mut tx = Transaction::default();
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    tx.vin.push(TxIn {
        prevout: OutPoint::null(),
        script_sig,
        sequence: u32::MAX,
    });
    tx.vout.push(TxOut {
        value,
        script_pubkey,
    });
    tx
}

fn spend(key: &Key, prevout: OutPoint, amount: i64, outputs: &[(i64, Vec<u8>)]) -> Transaction {
    let mut tx = Transaction::default();
    tx.vin.push(TxIn {
        prevout,
        script_sig: Vec::new(),
        sequence: u32::MAX,
    });
    tx.vout = outputs
        .iter()
        .map(|(value, script_pubkey)| TxOut {
            value: *value,
            script_pubkey: script_pubkey.clone(),
        })
        .collect();
    key.sign(&mut tx, 0, amount);
    tx
}

fn make_block(prev_block: Hash256, nonce: u8, transactions: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    Block {
        header: BlockHeader {
            version: 4,
            prev_block,
            merkle_root: merkle_root(&txids).0,
            final_sapling_root: [0u8; 32],
            time: TIME + u32::from(nonce),
            bits: BITS,
            nonce: [nonce; 32],
            solution: Vec::new(),
        },
        transactions,
    }
}

fn fast_maturity() -> ConsensusParams {
    let mut params = consensus_params(Network::Regtest);
    params.coinbase_maturity = 1;
    params
}

fn open(
    store: &Arc<MemoryStore>,
    blocks: &Path,
    params: ConsensusParams,
) -> ChainState<MemoryStore> {
    let queue = CheckQueue::new(2, Arc::new(TemplateVerifier)).expect("queue");
    ChainState::open(Arc::clone(store), blocks, params, Arc::new(queue)).expect("open")
}

#[test]
fn spend_connects_and_disconnect_restores_the_coin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), fast_maturity());
    let alice = Key::new(0x42);
    let bob = Key::new(0x43);

    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 100, alice.script())]);
    let coin = OutPoint::new(genesis.transactions[0].txid(), 0);
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");
    assert_eq!(chain.tip_height(), 0);

    let payment = spend(&alice, coin.clone(), 100, &[(60, bob.script())]);
    let paid = OutPoint::new(payment.txid(), 0);
    let block1 = make_block(
        genesis.hash(),
        1,
        vec![coinbase_tx(1, 0, alice.script()), payment],
    );
    let connected = chain
        .connect_block(&block1, ValidationFlags::block())
        .expect("block 1");
    assert_eq!(connected.height, 1);
    assert_eq!(connected.fees, 40);
    assert!(chain.utxos().coin(&coin).expect("read").is_none());
    assert_eq!(
        chain.utxos().coin(&paid).expect("read").map(|c| c.value),
        Some(60)
    );
    assert_eq!(
        chain.index().get(&block1.hash()).expect("entry").status,
        BlockStatus::ScriptValid
    );

    let disconnected = chain.disconnect_tip().expect("disconnect");
    assert_eq!(disconnected.hash, block1.hash());
    assert_eq!(chain.utxos().best_block(), genesis.hash());
    assert_eq!(
        chain.utxos().coin(&coin).expect("read").map(|c| c.value),
        Some(100)
    );
    assert!(chain.utxos().coin(&paid).expect("read").is_none());
    // The index keeps its status across a disconnect.
    assert_eq!(
        chain.index().get(&block1.hash()).expect("entry").status,
        BlockStatus::ScriptValid
    );

    chain
        .connect_block(&block1, ValidationFlags::block())
        .expect("reconnect");
    assert_eq!(chain.tip_height(), 1);
}

#[test]
fn bad_signature_fails_the_block_and_its_descendants() {
    zcore_log::enable_capture(256);
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), fast_maturity());
    let alice = Key::new(0x42);
    let mallory = Key::new(0x66);

    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 100, alice.script())]);
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");

    // Signed by the wrong key, but claiming alice's coin.
    let theft = spend(
        &mallory,
        OutPoint::new(genesis.transactions[0].txid(), 0),
        100,
        &[(100, mallory.script())],
    );
    let bad = make_block(
        genesis.hash(),
        1,
        vec![coinbase_tx(1, 0, alice.script()), theft],
    );
    let err = chain
        .connect_block(&bad, ValidationFlags::block())
        .expect_err("invalid script");
    assert!(matches!(
        err,
        ChainStateError::Consensus(ConsensusViolation::InvalidScript(_))
    ));
    assert!(err.is_consensus());
    assert!(!err.is_fatal());
    assert_eq!(chain.tip_height(), 0);
    assert_eq!(
        chain.index().get(&bad.hash()).expect("entry").status,
        BlockStatus::Failed
    );
    let bad_hash = bad.hash();
    assert!(matches!(
        chain.connect_block(&bad, ValidationFlags::block()),
        Err(ChainStateError::Consensus(ConsensusViolation::KnownInvalid(hash))) if hash == bad_hash
    ));

    let child = make_block(bad.hash(), 2, vec![coinbase_tx(2, 0, alice.script())]);
    let child_id = chain.accept_header(&child.header).expect("header");
    assert!(chain
        .index()
        .entry(child_id)
        .expect("entry")
        .status
        .is_failed());

    let logged = zcore_log::capture_snapshot(256);
    assert!(logged
        .iter()
        .any(|line| line.msg.contains("is invalid") && line.msg.contains("height 1")));
}

#[test]
fn tampered_body_leaves_the_header_usable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), fast_maturity());
    let alice = Key::new(0x42);
    let bob = Key::new(0x43);

    let mut reward = coinbase_tx(0, 100, alice.script());
    reward.vout.push(TxOut {
        value: 50,
        script_pubkey: alice.script(),
    });
    let genesis = make_block([0u8; 32], 0, vec![reward]);
    let reward_txid = genesis.transactions[0].txid();
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");

    let first = spend(&alice, OutPoint::new(reward_txid, 0), 100, &[(90, bob.script())]);
    let second = spend(&alice, OutPoint::new(reward_txid, 1), 50, &[(45, bob.script())]);
    let block1 = make_block(
        genesis.hash(),
        1,
        vec![coinbase_tx(1, 0, alice.script()), first, second.clone()],
    );
    let hash = block1.hash();

    let mut altered = block1.clone();
    altered.transactions[0] = coinbase_tx(1, 1, alice.script());
    assert!(matches!(
        chain.connect_block(&altered, ValidationFlags::block()),
        Err(ChainStateError::Consensus(ConsensusViolation::BadMerkleRoot))
    ));

    // Repeating the last transaction keeps the merkle root.
    let mut padded = block1.clone();
    padded.transactions.push(second);
    assert_eq!(padded.hash(), hash);
    let err = chain
        .connect_block(&padded, ValidationFlags::block())
        .expect_err("mutated");
    assert!(matches!(
        err,
        ChainStateError::Consensus(ConsensusViolation::MutatedMerkleTree)
    ));
    assert!(err.is_consensus());

    assert!(chain.index().get(&hash).is_none());
    assert!(chain.read_block(&hash).expect("read").is_none());
    assert_eq!(chain.tip_height(), 0);

    let connected = chain
        .connect_block(&block1, ValidationFlags::block())
        .expect("genuine block");
    assert_eq!(connected.hash, hash);
    assert_eq!(connected.fees, 15);
    assert_eq!(
        chain.index().get(&hash).expect("entry").status,
        BlockStatus::ScriptValid
    );
}

#[test]
fn immature_coinbase_spend_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), consensus_params(Network::Regtest));
    let alice = Key::new(0x42);

    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 100, alice.script())]);
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");
    let early = spend(
        &alice,
        OutPoint::new(genesis.transactions[0].txid(), 0),
        100,
        &[(90, alice.script())],
    );
    let block1 = make_block(
        genesis.hash(),
        1,
        vec![coinbase_tx(1, 0, alice.script()), early],
    );
    let err = chain
        .connect_block(&block1, ValidationFlags::block())
        .expect_err("immature");
    assert!(matches!(
        err,
        ChainStateError::Consensus(ConsensusViolation::PrematureCoinbaseSpend { depth: 1, .. })
    ));
}

#[test]
fn only_the_tip_can_be_extended() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), fast_maturity());
    let alice = Key::new(0x42);

    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 50, alice.script())]);
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");
    let orphan = make_block([9u8; 32], 1, vec![coinbase_tx(1, 0, alice.script())]);
    assert!(matches!(
        chain.connect_block(&orphan, ValidationFlags::block()),
        Err(ChainStateError::NotTip { .. })
    ));
    chain.disconnect_tip().expect("disconnect genesis");
    assert!(matches!(
        chain.disconnect_tip(),
        Err(ChainStateError::NoTip)
    ));
}

#[test]
fn equal_work_siblings_keep_the_first_seen_as_best() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let mut chain = open(&store, dir.path(), fast_maturity());
    let alice = Key::new(0x42);

    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 50, alice.script())]);
    chain
        .connect_block(&genesis, ValidationFlags::block())
        .expect("genesis");
    let first = make_block(genesis.hash(), 1, vec![coinbase_tx(1, 1, alice.script())]);
    let second = make_block(genesis.hash(), 2, vec![coinbase_tx(1, 2, alice.script())]);

    chain
        .connect_block(&first, ValidationFlags::block())
        .expect("first");
    chain.disconnect_tip().expect("disconnect");
    chain
        .connect_block(&second, ValidationFlags::block())
        .expect("second");

    let index = chain.index();
    let best = index.best_tip().and_then(|id| index.entry(id)).expect("best");
    assert_eq!(best.hash, first.hash());
    assert_eq!(chain.tip_entry().expect("tip").hash, second.hash());
    let genesis_id = index.lookup(&genesis.hash()).expect("genesis id");
    assert_eq!(index.children(genesis_id).len(), 2);
}

#[test]
fn state_survives_a_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let alice = Key::new(0x42);
    let genesis = make_block([0u8; 32], 0, vec![coinbase_tx(0, 75, alice.script())]);
    let block1 = make_block(genesis.hash(), 1, vec![coinbase_tx(1, 5, alice.script())]);
    {
        let mut chain = open(&store, dir.path(), fast_maturity());
        for block in [&genesis, &block1] {
            chain
                .connect_block(block, ValidationFlags::block())
                .expect("connect");
        }
        chain.queue().shutdown();
    }

    let chain = open(&store, dir.path(), fast_maturity());
    assert_eq!(chain.tip_height(), 1);
    assert_eq!(chain.index().len(), 2);
    let reread = chain
        .read_block(&block1.hash())
        .expect("read")
        .expect("stored");
    assert_eq!(reread.hash(), block1.hash());
    let coin = OutPoint::new(genesis.transactions[0].txid(), 0);
    assert_eq!(
        chain.utxos().coin(&coin).expect("read").map(|c| c.value),
        Some(75)
    );
}
