//! Randomized round-trip checks for the record codec.
//!
//! Generates records with a mix of template and raw scripts, random gaps and
//! spends, and checks that encoding, decoding, re-encoding and the
//! single-coin fast path all agree.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, ScriptBuf, TxOut, Txid};
use coindb_coins::Coins;
use coindb_primitives::MAX_MONEY;

fn random_txid() -> Txid {
    let mut bytes = [0u8; 32];
    for byte in &mut bytes {
        *byte = fastrand::u8(..);
    }
    Txid::from_byte_array(bytes)
}

fn random_hash20() -> Vec<u8> {
    (0..20).map(|_| fastrand::u8(..)).collect()
}

fn random_script() -> Vec<u8> {
    match fastrand::u8(..5) {
        0 => {
            // p2pkh
            let mut script = vec![0x76, 0xa9, 20];
            script.extend(random_hash20());
            script.extend_from_slice(&[0x88, 0xac]);
            script
        }
        1 => {
            // p2sh
            let mut script = vec![0xa9, 20];
            script.extend(random_hash20());
            script.push(0x87);
            script
        }
        2 => {
            // p2pk, compressed key; the compressor never validates the point
            let mut script = vec![33, 0x02 | fastrand::u8(..2)];
            script.extend((0..32).map(|_| fastrand::u8(..)));
            script.push(0xac);
            script
        }
        3 => {
            // p2pk, uncompressed key; a real curve point so it compresses
            hex::decode(
                "410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da758937\
                 9515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac",
            )
            .unwrap()
        }
        _ => {
            // raw script; the lead OP_1 keeps it spendable
            let mut script = vec![0x51];
            script.extend((0..fastrand::usize(..=40)).map(|_| fastrand::u8(..)));
            script
        }
    }
}

#[test]
fn test_random_records_roundtrip() {
    for _ in 0..64 {
        let txid = random_txid();
        let count = fastrand::u32(1..=20);
        let mut coins = Coins::new(
            txid,
            fastrand::u32(1..=2),
            fastrand::i32(1..=800_000),
            fastrand::bool(),
        );

        let mut expected: Vec<Option<TxOut>> = vec![None; count as usize];
        for index in 0..count {
            if fastrand::u8(..4) == 0 {
                continue; // gap
            }
            let output = TxOut {
                value: Amount::from_sat(fastrand::u64(..MAX_MONEY)),
                script_pubkey: ScriptBuf::from_bytes(random_script()),
            };
            coins.add_output(index, output.clone());
            expected[index as usize] = Some(output);
        }
        if coins.is_empty() {
            continue;
        }

        let data = coins.encode();

        // Decoding and immediately re-encoding is a byte-for-byte copy.
        let mut decoded = Coins::decode(txid, data.clone()).unwrap();
        assert_eq!(decoded.encode(), data);

        for (index, want) in expected.iter().enumerate() {
            let index = index as u32;
            match want {
                Some(output) => {
                    assert!(decoded.is_unspent(index));
                    assert_eq!(decoded.get_output(index).unwrap().unwrap(), output);
                }
                None => assert!(!decoded.has(index)),
            }
        }

        // The fast path agrees with the container at every index, including
        // past the end of the record.
        for index in 0..count + 8 {
            let fast = Coins::parse_coin(&data, txid, index).unwrap();
            let full = decoded.get_coin(index).unwrap();
            assert_eq!(fast, full, "fast path diverges at index {index}");
        }

        // A random spend survives a flush.
        let victim = fastrand::u32(..count);
        let spent = decoded.spend(victim);
        if decoded.is_empty() {
            continue;
        }
        let mut redecoded = Coins::decode(txid, decoded.encode()).unwrap();
        for (index, want) in expected.iter().enumerate() {
            let index = index as u32;
            let alive = want.is_some() && (index != victim || spent.is_none());
            assert_eq!(redecoded.is_unspent(index), alive);
            if alive {
                assert_eq!(
                    redecoded.get_output(index).unwrap().unwrap(),
                    want.as_ref().unwrap()
                );
            }
        }
    }
}
