use zcore_consensus::Hash256;
use zcore_primitives::transaction::{JoinSplit, SproutProof, Transaction};

use crate::params::{ParamsId, ParamsKind, ParamsSet};
use crate::{ShieldedComponent, ShieldedError};

/// Zero-knowledge proof checker. Implementations must be deterministic.
pub trait ProofVerifier: Send + Sync {
    fn verify_proof(&self, params: &ParamsId, proof: &[u8], public_inputs: &[u8]) -> bool;
}

/// Checks every Sapling spend, Sapling output and Groth16 joinsplit proof of `tx`.
///
/// Public inputs are the consensus encodings of the fields each circuit commits to, in
/// transaction order. Pre-Sapling PHGR joinsplit proofs are not checked.
pub fn verify_shielded(
    tx: &Transaction,
    params: &ParamsSet,
    verifier: &dyn ProofVerifier,
) -> Result<(), ShieldedError> {
    for (index, spend) in tx.shielded_spends.iter().enumerate() {
        let inputs = concat(&[&spend.cv, &spend.anchor, &spend.nullifier, &spend.rk]);
        check(
            verifier,
            params.get(ParamsKind::SaplingSpend),
            &spend.zkproof,
            &inputs,
            ShieldedComponent::SaplingSpend,
            index,
        )?;
    }

    for (index, output) in tx.shielded_outputs.iter().enumerate() {
        let inputs = concat(&[&output.cv, &output.cmu, &output.ephemeral_key]);
        check(
            verifier,
            params.get(ParamsKind::SaplingOutput),
            &output.zkproof,
            &inputs,
            ShieldedComponent::SaplingOutput,
            index,
        )?;
    }

    for (index, join_split) in tx.join_splits.iter().enumerate() {
        let SproutProof::Groth(proof) = &join_split.proof else {
            zcore_log::log_trace!("skipping PHGR joinsplit proof {index}");
            continue;
        };
        let inputs = joinsplit_inputs(join_split, &tx.join_split_pub_key)
            .ok_or(ShieldedError::ValueOutOfRange(ShieldedComponent::JoinSplit, index))?;
        check(
            verifier,
            params.get(ParamsKind::SproutGroth16),
            proof,
            &inputs,
            ShieldedComponent::JoinSplit,
            index,
        )?;
    }

    Ok(())
}

fn check(
    verifier: &dyn ProofVerifier,
    params: &ParamsId,
    proof: &[u8],
    inputs: &[u8],
    component: ShieldedComponent,
    index: usize,
) -> Result<(), ShieldedError> {
    if verifier.verify_proof(params, proof, inputs) {
        Ok(())
    } else {
        Err(ShieldedError::InvalidProof { component, index })
    }
}

fn concat(fields: &[&Hash256]) -> Vec<u8> {
    fields.iter().flat_map(|field| field.iter().copied()).collect()
}

fn joinsplit_inputs(join_split: &JoinSplit, pub_key: &[u8; 32]) -> Option<Vec<u8>> {
    let vpub_old = u64::try_from(join_split.vpub_old).ok()?;
    let vpub_new = u64::try_from(join_split.vpub_new).ok()?;
    let h_sig = joinsplit_hsig(&join_split.random_seed, &join_split.nullifiers, pub_key);

    let mut inputs = concat(&[
        &join_split.anchor,
        &h_sig,
        &join_split.macs[0],
        &join_split.macs[1],
        &join_split.nullifiers[0],
        &join_split.nullifiers[1],
        &join_split.commitments[0],
        &join_split.commitments[1],
    ]);
    inputs.extend_from_slice(&vpub_old.to_le_bytes());
    inputs.extend_from_slice(&vpub_new.to_le_bytes());
    Some(inputs)
}

/// The joinsplit signature hash `hSig`.
pub fn joinsplit_hsig(random_seed: &Hash256, nullifiers: &[Hash256; 2], pub_key: &[u8; 32]) -> Hash256 {
    let mut state = blake2b_simd::Params::new()
        .hash_length(32)
        .personal(b"ZcashComputehSig")
        .to_state();
    state.update(random_seed);
    for nullifier in nullifiers {
        state.update(nullifier);
    }
    state.update(pub_key);
    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use zcore_consensus::Network;
    use zcore_primitives::transaction::{OutputDescription, SpendDescription};

    use super::*;

    /// Records every call and rejects proofs starting with 0xff.
    #[derive(Default)]
    struct RecordingVerifier {
        calls: Mutex<Vec<(ParamsId, Vec<u8>)>>,
    }

    impl ProofVerifier for RecordingVerifier {
        fn verify_proof(&self, params: &ParamsId, proof: &[u8], public_inputs: &[u8]) -> bool {
            self.calls
                .lock()
                .expect("calls lock")
                .push((*params, public_inputs.to_vec()));
            proof.first() != Some(&0xff)
        }
    }

    fn spend(seed: u8) -> SpendDescription {
        SpendDescription {
            cv: [seed; 32],
            anchor: [seed + 1; 32],
            nullifier: [seed + 2; 32],
            rk: [seed + 3; 32],
            zkproof: [0; 192],
            spend_auth_sig: [0; 64],
        }
    }

    fn output(seed: u8) -> OutputDescription {
        OutputDescription {
            cv: [seed; 32],
            cmu: [seed + 1; 32],
            ephemeral_key: [seed + 2; 32],
            enc_ciphertext: [0; 580],
            out_ciphertext: [0; 80],
            zkproof: [0; 192],
        }
    }

    #[test]
    fn every_description_reaches_the_verifier() {
        let params = ParamsSet::for_network(Network::Testnet).expect("ids");
        let mut tx = Transaction::sapling();
        tx.shielded_spends = vec![spend(1), spend(10)];
        tx.shielded_outputs = vec![output(20)];

        let verifier = RecordingVerifier::default();
        verify_shielded(&tx, &params, &verifier).expect("valid proofs");

        let calls = verifier.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, params.sapling_spend);
        assert_eq!(calls[1].1[..32], [10u8; 32]);
        assert_eq!(calls[1].1.len(), 128);
        assert_eq!(calls[2].0, params.sapling_output);
        assert_eq!(calls[2].1.len(), 96);
    }

    #[test]
    fn first_bad_proof_is_reported() {
        let params = ParamsSet::for_network(Network::Mainnet).expect("ids");
        let mut tx = Transaction::sapling();
        let mut bad = output(5);
        bad.zkproof[0] = 0xff;
        tx.shielded_outputs = vec![output(1), bad];

        let err = verify_shielded(&tx, &params, &RecordingVerifier::default())
            .expect_err("bad proof");
        assert_eq!(
            err,
            ShieldedError::InvalidProof {
                component: ShieldedComponent::SaplingOutput,
                index: 1,
            }
        );
    }

    #[test]
    fn hsig_depends_on_pub_key() {
        let seed = [1u8; 32];
        let nullifiers = [[2u8; 32], [3u8; 32]];
        assert_ne!(
            joinsplit_hsig(&seed, &nullifiers, &[4u8; 32]),
            joinsplit_hsig(&seed, &nullifiers, &[5u8; 32])
        );
    }
}
