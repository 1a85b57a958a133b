use zcore_primitives::outpoint::OutPoint;
use zcore_primitives::transaction::{Transaction, TxIn, TxOut};
use zcore_script::sighash::{
    signature_hash, SighashError, SighashType, SigningInput, SIGHASH_ALL, SIGHASH_ANYONECANPAY,
    SIGHASH_NONE, SIGHASH_SINGLE,
};

const SAPLING_BRANCH_ID: u32 = 0x76b8_09bb;
const BLOSSOM_BRANCH_ID: u32 = 0x2bb4_0e60;

fn spend_tx(mut tx: Transaction) -> Transaction {
    for index in 0..2u8 {
        tx.vin.push(TxIn {
            prevout: OutPoint::new([index + 1; 32], index as u32),
            script_sig: Vec::new(),
            sequence: u32::MAX - index as u32,
        });
    }
    tx.vout.push(TxOut {
        value: 5_000,
        script_pubkey: vec![0x51],
    });
    tx
}

fn input(index: usize, amount: i64) -> SigningInput<'static> {
    SigningInput {
        index,
        script_code: &[0x76, 0xa9],
        amount,
    }
}

#[test]
fn v4_digest_commits_to_amount_and_branch() {
    let tx = spend_tx(Transaction::sapling());
    let all = SighashType(SIGHASH_ALL);
    let base = signature_hash(&tx, Some(input(0, 100)), all, SAPLING_BRANCH_ID)
        .expect("sighash");
    let other_amount = signature_hash(&tx, Some(input(0, 101)), all, SAPLING_BRANCH_ID)
        .expect("sighash");
    let other_branch = signature_hash(&tx, Some(input(0, 100)), all, BLOSSOM_BRANCH_ID)
        .expect("sighash");
    let other_input = signature_hash(&tx, Some(input(1, 100)), all, SAPLING_BRANCH_ID)
        .expect("sighash");
    assert_ne!(base, other_amount);
    assert_ne!(base, other_branch);
    assert_ne!(base, other_input);
}

#[test]
fn legacy_digest_ignores_amount_and_branch() {
    let tx = spend_tx(Transaction::default());
    let all = SighashType(SIGHASH_ALL);
    let base = signature_hash(&tx, Some(input(0, 100)), all, 0).expect("sighash");
    let other = signature_hash(&tx, Some(input(0, 7)), all, SAPLING_BRANCH_ID).expect("sighash");
    assert_eq!(base, other);
}

#[test]
fn anyone_can_pay_ignores_other_inputs() {
    for template in [Transaction::default(), Transaction::sapling()] {
        let tx = spend_tx(template);
        let mut changed = tx.clone();
        changed.vin[1].prevout = OutPoint::new([0xee; 32], 9);

        let acp = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let all = SighashType(SIGHASH_ALL);
        let before = signature_hash(&tx, Some(input(0, 1)), acp, SAPLING_BRANCH_ID).expect("acp");
        let after =
            signature_hash(&changed, Some(input(0, 1)), acp, SAPLING_BRANCH_ID).expect("acp");
        assert_eq!(before, after);

        let before = signature_hash(&tx, Some(input(0, 1)), all, SAPLING_BRANCH_ID).expect("all");
        let after =
            signature_hash(&changed, Some(input(0, 1)), all, SAPLING_BRANCH_ID).expect("all");
        assert_ne!(before, after);
    }
}

#[test]
fn none_ignores_outputs() {
    let tx = spend_tx(Transaction::sapling());
    let mut changed = tx.clone();
    changed.vout[0].value += 1;
    let none = SighashType(SIGHASH_NONE);
    assert_eq!(
        signature_hash(&tx, Some(input(0, 1)), none, SAPLING_BRANCH_ID),
        signature_hash(&changed, Some(input(0, 1)), none, SAPLING_BRANCH_ID)
    );
}

#[test]
fn legacy_single_without_matching_output_fails() {
    let tx = spend_tx(Transaction::default());
    let single = SighashType(SIGHASH_SINGLE);
    assert!(signature_hash(&tx, Some(input(0, 0)), single, 0).is_ok());
    assert_eq!(
        signature_hash(&tx, Some(input(1, 0)), single, 0),
        Err(SighashError::MissingOutput)
    );
}

#[test]
fn out_of_range_input_fails() {
    let tx = spend_tx(Transaction::sapling());
    assert_eq!(
        signature_hash(&tx, Some(input(2, 0)), SighashType(SIGHASH_ALL), 0),
        Err(SighashError::InputIndexOutOfRange)
    );
}

#[test]
fn shielded_only_digest_needs_overwinter() {
    let sapling = spend_tx(Transaction::sapling());
    assert!(signature_hash(&sapling, None, SighashType(SIGHASH_ALL), SAPLING_BRANCH_ID).is_ok());
    let legacy = spend_tx(Transaction::default());
    assert!(signature_hash(&legacy, None, SighashType(SIGHASH_ALL), 0).is_err());
}
