//! Identifier generation
//!
//! Contract IDs are `ct_` + 32 lowercase hex (16 random bytes), call IDs
//! `cc_` + 32 hex, verification records `vr_` + 32 hex, and bond ledger
//! references `vbond_` + 12 hex.

use rand::RngCore;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn contract_id() -> String {
    format!("ct_{}", random_hex(16))
}

pub fn call_id() -> String {
    format!("cc_{}", random_hex(16))
}

pub fn verification_id() -> String {
    format!("vr_{}", random_hex(16))
}

pub fn bond_reference() -> String {
    format!("vbond_{}", random_hex(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_hex(s: &str) {
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_contract_id_format() {
        let id = contract_id();
        assert!(id.starts_with("ct_"));
        assert_eq!(id.len(), 3 + 32);
        assert_hex(&id[3..]);
    }

    #[test]
    fn test_call_id_format() {
        let id = call_id();
        assert!(id.starts_with("cc_"));
        assert_eq!(id.len(), 3 + 32);
        assert_hex(&id[3..]);
    }

    #[test]
    fn test_bond_reference_format() {
        let reference = bond_reference();
        assert!(reference.starts_with("vbond_"));
        assert_eq!(reference.len(), 6 + 12);
        assert_hex(&reference[6..]);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(contract_id(), contract_id());
        assert_ne!(call_id(), call_id());
    }
}
