use zcore_consensus::Hash256;
use zcore_primitives::block::{Block, BlockHeader, CURRENT_VERSION};
use zcore_primitives::encoding::{DecodeError, Decoder};
use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::{
    OutputDescription, SpendDescription, Transaction, TxFormat, TxIn, TxOut,
    OVERWINTER_VERSION_GROUP_ID, SAPLING_VERSION_GROUP_ID,
};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn header(prev: Hash256) -> BlockHeader {
    BlockHeader {
        version: CURRENT_VERSION,
        prev_block: prev,
        merkle_root: seq_hash(0x20),
        final_sapling_root: seq_hash(0x40),
        time: 0x0102_0304,
        bits: 0x200f_0f0f,
        nonce: seq_hash(0x60),
        solution: vec![0xaa, 0xbb, 0xcc],
    }
}

fn coinbase(value: i64) -> Transaction {
    Transaction {
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x51, 0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        ..Transaction::default()
    }
}

#[test]
fn block_header_layout() {
    let header = header(seq_hash(0x00));
    let encoded = zcore_primitives::encoding::encode(&header);

    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    expected.extend_from_slice(&seq_hash(0x00));
    expected.extend_from_slice(&seq_hash(0x20));
    expected.extend_from_slice(&seq_hash(0x40));
    expected.extend_from_slice(&0x0102_0304u32.to_le_bytes());
    expected.extend_from_slice(&0x200f_0f0fu32.to_le_bytes());
    expected.extend_from_slice(&seq_hash(0x60));
    expected.push(3);
    expected.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
    assert_eq!(encoded, expected);

    let decoded: BlockHeader = zcore_primitives::encoding::decode(&encoded).expect("decode");
    assert_eq!(decoded.hash(), header.hash());
}

#[test]
fn sapling_transaction_layout() {
    let mut tx = Transaction::sapling();
    tx.vin.push(TxIn {
        prevout: OutPoint::new(seq_hash(0x10), 1),
        script_sig: vec![0x00],
        sequence: 0xffff_fffe,
    });
    tx.vout.push(TxOut {
        value: 5_000,
        script_pubkey: vec![0x6a],
    });
    tx.expiry_height = 77;
    tx.value_balance = -10;
    tx.shielded_outputs.push(OutputDescription {
        cv: seq_hash(1),
        cmu: seq_hash(2),
        ephemeral_key: seq_hash(3),
        enc_ciphertext: [4u8; 580],
        out_ciphertext: [5u8; 80],
        zkproof: [6u8; 192],
    });
    tx.binding_sig = [7u8; 64];

    let bytes = tx.serialize();
    assert_eq!(&bytes[..4], &(4u32 | 1 << 31).to_le_bytes());
    assert_eq!(&bytes[4..8], &SAPLING_VERSION_GROUP_ID.to_le_bytes());
    assert_eq!(&bytes[bytes.len() - 64..], &[7u8; 64]);
    assert_eq!(tx.format(), Ok(TxFormat::Sapling));

    let decoded = Transaction::deserialize(&bytes).expect("decode sapling tx");
    assert_eq!(decoded, tx);
    assert_eq!(decoded.txid(), tx.txid());
    assert!(decoded.has_shielded_components());
}

#[test]
fn sapling_without_shielded_parts_omits_binding_sig() {
    let mut tx = Transaction::sapling();
    tx.vout.push(TxOut {
        value: 1,
        script_pubkey: Vec::new(),
    });
    let bytes = tx.serialize();
    // header, group, vin, vout(1 + 8 + 1), locktime, expiry, balance, spends, outputs, joinsplits
    assert_eq!(bytes.len(), 4 + 4 + 1 + 10 + 4 + 4 + 8 + 1 + 1 + 1);
}

#[test]
fn overwintered_with_wrong_group_is_rejected() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(4u32 | 1 << 31).to_le_bytes());
    bytes.extend_from_slice(&OVERWINTER_VERSION_GROUP_ID.to_le_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    assert!(matches!(
        Transaction::deserialize(&bytes),
        Err(DecodeError::InvalidData(_))
    ));
}

#[test]
fn truncated_spend_is_eof() {
    let mut tx = Transaction::sapling();
    tx.shielded_spends.push(SpendDescription {
        cv: seq_hash(1),
        anchor: seq_hash(2),
        nullifier: seq_hash(3),
        rk: seq_hash(4),
        zkproof: [0u8; 192],
        spend_auth_sig: [0u8; 64],
    });
    let bytes = tx.serialize();
    assert_eq!(
        Transaction::deserialize(&bytes[..bytes.len() - 100]),
        Err(DecodeError::UnexpectedEof)
    );
}

#[test]
fn coinbase_detection_and_value_out() {
    let tx = coinbase(40);
    assert!(tx.is_coinbase());
    assert_eq!(tx.value_out(), Some(40));

    let mut overflow = coinbase(i64::MAX);
    overflow.vout.push(TxOut {
        value: 1,
        script_pubkey: Vec::new(),
    });
    assert_eq!(overflow.value_out(), None);
}

#[test]
fn concatenated_blocks_decode_in_sequence() {
    let first = Block {
        header: header([0u8; 32]),
        transactions: vec![coinbase(50)],
    };
    let second = Block {
        header: header(first.hash()),
        transactions: vec![coinbase(60)],
    };
    let mut stream = first.serialize();
    stream.extend_from_slice(&second.serialize());

    let mut decoder = Decoder::new(&stream);
    let a = Block::decode_from(&mut decoder).expect("first block");
    let b = Block::decode_from(&mut decoder).expect("second block");
    assert!(decoder.is_empty());
    assert_eq!(a, first);
    assert_eq!(b.header.prev_block, a.hash());
    assert!(a.header.is_genesis());
}
