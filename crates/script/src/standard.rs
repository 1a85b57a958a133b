//! Standard script classification and legacy signature-operation counting.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    NullData,
    Unknown,
}

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1NEGATE: u8 = 0x4f;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Signature operations charged for a bare CHECKMULTISIG.
const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Largest OP_RETURN output relayed by default.
pub const MAX_OP_RETURN_RELAY: usize = 80;

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if is_null_data(script) {
        ScriptType::NullData
    } else {
        ScriptType::Unknown
    }
}

/// The 20-byte key hash committed to by a P2PKH script.
pub fn p2pkh_key_hash(script: &[u8]) -> Option<&[u8]> {
    is_p2pkh(script).then(|| &script[3..23])
}

/// The public key committed to by a P2PK script.
pub fn p2pk_key(script: &[u8]) -> Option<&[u8]> {
    is_p2pk(script).then(|| &script[1..script.len() - 1])
}

pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2pk(script: &[u8]) -> bool {
    match script.first() {
        Some(&len @ (33 | 65)) => {
            script.len() == len as usize + 2 && script[script.len() - 1] == OP_CHECKSIG
        }
        _ => false,
    }
}

fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
        && script.len() <= MAX_OP_RETURN_RELAY + 3
        && parse_pushes(&script[1..]).is_some()
}

/// Splits a push-only script into its pushed items. Returns `None` if the script contains
/// anything other than data pushes or a push runs past the end.
pub fn parse_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    for op in Ops::new(script) {
        match op? {
            Op::Push(data) => items.push(data.to_vec()),
            Op::Number(value) => items.push(small_number(value)),
            Op::Other(_) => return None,
        }
    }
    Some(items)
}

pub fn is_push_only(script: &[u8]) -> bool {
    parse_pushes(script).is_some()
}

/// Legacy (inaccurate) signature-operation count used for the per-block limit.
pub fn legacy_sigop_count(script: &[u8]) -> usize {
    let mut count = 0;
    for op in Ops::new(script) {
        match op {
            Some(Op::Other(OP_CHECKSIG | OP_CHECKSIGVERIFY)) => count += 1,
            Some(Op::Other(OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => {
                count += MAX_PUBKEYS_PER_MULTISIG
            }
            Some(_) => {}
            None => break,
        }
    }
    count
}

fn small_number(value: i8) -> Vec<u8> {
    match value {
        0 => Vec::new(),
        -1 => vec![0x81],
        n => vec![n as u8],
    }
}

enum Op<'a> {
    Push(&'a [u8]),
    Number(i8),
    Other(u8),
}

/// Opcode iterator. Yields `None` once for a truncated push, then stops.
struct Ops<'a> {
    script: &'a [u8],
    cursor: usize,
    done: bool,
}

impl<'a> Ops<'a> {
    fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            cursor: 0,
            done: false,
        }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.cursor.checked_add(len)?;
        let bytes = self.script.get(self.cursor..end)?;
        self.cursor = end;
        Some(bytes)
    }

    fn read_op(&mut self) -> Option<Op<'a>> {
        let opcode = self.take(1)?[0];
        let op = match opcode {
            OP_0 => Op::Number(0),
            0x01..=0x4b => Op::Push(self.take(opcode as usize)?),
            OP_PUSHDATA1 => {
                let len = self.take(1)?[0] as usize;
                Op::Push(self.take(len)?)
            }
            OP_PUSHDATA2 => {
                let raw = self.take(2)?;
                let len = u16::from_le_bytes([raw[0], raw[1]]) as usize;
                Op::Push(self.take(len)?)
            }
            OP_PUSHDATA4 => {
                let raw = self.take(4)?;
                let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                Op::Push(self.take(len)?)
            }
            OP_1NEGATE => Op::Number(-1),
            OP_1..=OP_16 => Op::Number((opcode - OP_1 + 1) as i8),
            other => Op::Other(other),
        };
        Some(op)
    }
}

impl<'a> Iterator for Ops<'a> {
    type Item = Option<Op<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.script.len() {
            return None;
        }
        let op = self.read_op();
        if op.is_none() {
            self.done = true;
        }
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_are_split() {
        let script = [0x02, 0xaa, 0xbb, OP_0, OP_PUSHDATA1, 0x01, 0xcc, 0x53];
        let items = parse_pushes(&script).expect("push only");
        assert_eq!(
            items,
            vec![vec![0xaa, 0xbb], vec![], vec![0xcc], vec![0x03]]
        );
    }

    #[test]
    fn truncated_push_is_rejected() {
        assert!(parse_pushes(&[0x05, 0x01, 0x02]).is_none());
        assert!(parse_pushes(&[OP_PUSHDATA2, 0x01]).is_none());
    }

    #[test]
    fn non_push_opcode_is_rejected() {
        assert!(!is_push_only(&[0x01, 0x01, OP_DUP]));
    }
}
