use std::collections::HashMap;
use std::sync::Arc;

use zcore_chainstate::utxo::{CoinsView, UtxoEntry, UtxoError, UtxoOverlay, UtxoSet};
use zcore_primitives::outpoint::OutPoint;
use zcore_storage::memory::MemoryStore;

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn outpoint(n: u64) -> OutPoint {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&n.to_le_bytes());
    OutPoint::new(hash, (n % 3) as u32)
}

fn coin(value: i64) -> UtxoEntry {
    UtxoEntry {
        value,
        script_pubkey: vec![0x51],
        height: 1,
        is_coinbase: false,
    }
}

/// Applies a random spend or create to `view` and mirrors it in `model`.
fn random_step<P: CoinsView + ?Sized>(
    rng: &mut Lcg,
    view: &mut UtxoOverlay<'_, P>,
    model: &mut HashMap<OutPoint, i64>,
) {
    let key = outpoint(rng.below(24));
    if rng.below(2) == 0 {
        let value = rng.below(1_000) as i64 + 1;
        match view.create(key.clone(), coin(value)) {
            Ok(()) => assert!(model.insert(key, value).is_none(), "create over unspent"),
            Err(UtxoError::Conflict(_)) => assert!(model.contains_key(&key)),
            Err(err) => panic!("unexpected {err}"),
        }
    } else {
        match view.spend(&key) {
            Ok(spent) => assert_eq!(model.remove(&key), Some(spent.value)),
            Err(UtxoError::NotFound(_)) => assert!(!model.contains_key(&key)),
            Err(err) => panic!("unexpected {err}"),
        }
    }
}

#[test]
fn flushed_layers_match_a_flat_model() {
    let mut rng = Lcg(0x5eed);
    for _round in 0..20 {
        let store = Arc::new(MemoryStore::new());
        let mut base = UtxoSet::open(Arc::clone(&store)).expect("open");
        let mut model = HashMap::new();

        let mut outer = UtxoOverlay::new(&mut base);
        for _ in 0..40 {
            random_step(&mut rng, &mut outer, &mut model);
        }
        {
            let mut inner = UtxoOverlay::new(&mut outer);
            for _ in 0..40 {
                random_step(&mut rng, &mut inner, &mut model);
            }
            inner.flush().expect("flush inner");
        }
        outer.flush().expect("flush outer");

        for n in 0..24 {
            let key = outpoint(n);
            let stored = base.coin(&key).expect("read").map(|coin| coin.value);
            assert_eq!(stored, model.get(&key).copied(), "outpoint {key}");
        }
    }
}

#[test]
fn discarded_inner_layer_leaves_outer_untouched() {
    let store = Arc::new(MemoryStore::new());
    let mut base = UtxoSet::open(Arc::clone(&store)).expect("open");
    let mut outer = UtxoOverlay::new(&mut base);
    outer.create(outpoint(1), coin(10)).expect("create");
    {
        let mut inner = UtxoOverlay::new(&mut outer);
        assert_eq!(inner.spend(&outpoint(1)).expect("spend").value, 10);
        assert!(matches!(
            inner.spend(&outpoint(1)),
            Err(UtxoError::NotFound(_))
        ));
        inner.create(outpoint(2), coin(20)).expect("create");
    }
    assert!(outer.have_coin(&outpoint(1)).expect("read"));
    assert!(!outer.have_coin(&outpoint(2)).expect("read"));
    assert!(matches!(
        outer.create(outpoint(1), coin(11)),
        Err(UtxoError::Conflict(_))
    ));
}

#[test]
fn spend_of_base_output_through_two_layers() {
    let store = Arc::new(MemoryStore::new());
    let mut base = UtxoSet::open(Arc::clone(&store)).expect("open");
    let mut seed = UtxoOverlay::new(&mut base);
    seed.create(outpoint(7), coin(100)).expect("seed");
    seed.flush().expect("flush");

    let mut outer = UtxoOverlay::new(&mut base);
    let mut inner = UtxoOverlay::new(&mut outer);
    let spent = inner.spend(&outpoint(7)).expect("spend");
    inner.create(outpoint(8), coin(60)).expect("change");
    assert_eq!(spent.value - 60, 40);
    inner.flush().expect("flush inner");
    outer.flush().expect("flush outer");

    assert!(base.coin(&outpoint(7)).expect("read").is_none());
    assert_eq!(
        base.coin(&outpoint(8)).expect("read").map(|coin| coin.value),
        Some(60)
    );
    let mut again = UtxoOverlay::new(&mut base);
    assert!(matches!(
        again.spend(&outpoint(7)),
        Err(UtxoError::NotFound(_))
    ));
}
