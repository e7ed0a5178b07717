//! # Addresses and Keys
//!
//! Base58check addresses and WIF keys with Junkcoin version bytes, which the `bitcoin`
//! crate's own `Address` and `PrivateKey` types reject.

use bitcoin::{
    PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash, Transaction, base58,
    ecdsa,
    hashes::Hash,
    secp256k1::{self, All, Message, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, SighashCache},
};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while parsing addresses and keys or signing
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid base58 or checksum
    #[error("invalid base58: {0}")]
    Base58(#[from] base58::Error),
    /// Decoded payload has the wrong length
    #[error("invalid payload length {0}")]
    InvalidLength(usize),
    /// Version byte does not belong to the network
    #[error("version byte {0:#04x} is not valid for {1}")]
    UnknownVersion(u8, Network),
    /// Malformed secret key
    #[error("invalid key: {0}")]
    Key(#[from] secp256k1::Error),
    /// Sighash could not be computed for the requested input
    #[error("cannot sign input {0}")]
    Sighash(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Chain parameters used for base58 encoding
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Network {
    /// Main network
    #[default]
    Mainnet,
    /// Test network
    Testnet,
}

impl Network {
    /// Version byte of pay-to-pubkey-hash addresses
    pub fn pubkey_hash_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x10,
            Network::Testnet => 0x71,
        }
    }

    /// Version byte of pay-to-script-hash addresses
    pub fn script_hash_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            Network::Testnet => 0xc4,
        }
    }

    /// Version byte of wallet-import-format keys
    pub fn wif_prefix(self) -> u8 {
        match self {
            Network::Mainnet => 0x90,
            Network::Testnet => 0xf1,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

/// The hash an address pays to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Pay to public key hash
    PubkeyHash(PubkeyHash),
    /// Pay to script hash
    ScriptHash(ScriptHash),
}

/// A base58check address bound to a network
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Address {
    payload: Payload,
    network: Network,
}

impl Address {
    /// Parses an address, checking checksum, length and version byte
    pub fn parse(s: &str, network: Network) -> Result<Self> {
        let data = base58::decode_check(s)?;
        if data.len() != 21 {
            return Err(Error::InvalidLength(data.len()));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[1..]);

        let payload = match data[0] {
            v if v == network.pubkey_hash_prefix() => {
                Payload::PubkeyHash(PubkeyHash::from_byte_array(hash))
            }
            v if v == network.script_hash_prefix() => {
                Payload::ScriptHash(ScriptHash::from_byte_array(hash))
            }
            v => return Err(Error::UnknownVersion(v, network)),
        };

        Ok(Self { payload, network })
    }

    /// Pay-to-pubkey-hash address of a public key
    pub fn p2pkh(public_key: &PublicKey, network: Network) -> Self {
        Self {
            payload: Payload::PubkeyHash(public_key.pubkey_hash()),
            network,
        }
    }

    /// Returns the payload
    pub fn payload(&self) -> Payload {
        self.payload
    }

    /// Locking script paying to this address
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self.payload {
            Payload::PubkeyHash(hash) => ScriptBuf::new_p2pkh(&hash),
            Payload::ScriptHash(hash) => ScriptBuf::new_p2sh(&hash),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut data = Vec::with_capacity(21);
        match self.payload {
            Payload::PubkeyHash(hash) => {
                data.push(self.network.pubkey_hash_prefix());
                data.extend_from_slice(hash.as_byte_array());
            }
            Payload::ScriptHash(hash) => {
                data.push(self.network.script_hash_prefix());
                data.extend_from_slice(hash.as_byte_array());
            }
        }
        write!(f, "{}", base58::encode_check(&data))
    }
}

/// The single signing key of a wallet
pub struct WalletKey {
    secret: SecretKey,
    public: PublicKey,
    network: Network,
    secp: Secp256k1<All>,
}

impl WalletKey {
    /// Wraps a secret key; the public key is compressed
    pub fn from_secret(secret: SecretKey, network: Network) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &secret));
        Self {
            secret,
            public,
            network,
            secp,
        }
    }

    /// Generates a fresh random key
    pub fn generate(network: Network) -> Self {
        Self::from_secret(SecretKey::new(&mut secp256k1::rand::thread_rng()), network)
    }

    /// Parses a wallet-import-format key
    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let data = base58::decode_check(wif)?;
        let compressed = match data.len() {
            33 => false,
            34 if data[33] == 1 => true,
            len => return Err(Error::InvalidLength(len)),
        };

        if data[0] != network.wif_prefix() {
            return Err(Error::UnknownVersion(data[0], network));
        }

        let mut key = Self::from_secret(SecretKey::from_slice(&data[1..33])?, network);
        key.public.compressed = compressed;
        Ok(key)
    }

    /// Encodes the key in wallet-import-format
    pub fn to_wif(&self) -> String {
        let mut data = Vec::with_capacity(34);
        data.push(self.network.wif_prefix());
        data.extend_from_slice(&self.secret.secret_bytes());
        if self.public.compressed {
            data.push(1);
        }
        base58::encode_check(&data)
    }

    /// Returns the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the network the key encodes for
    pub fn network(&self) -> Network {
        self.network
    }

    /// Pay-to-pubkey-hash address of the key
    pub fn address(&self) -> Address {
        Address::p2pkh(&self.public, self.network)
    }

    /// Signs `input` of `tx` with `SIGHASH_ALL` against `script_code`, returning the DER
    /// signature followed by the sighash type byte
    pub fn sign(&self, tx: &Transaction, input: usize, script_code: &Script) -> Result<Vec<u8>> {
        let sighash = SighashCache::new(tx)
            .legacy_signature_hash(input, script_code, EcdsaSighashType::All.to_u32())
            .map_err(|_| Error::Sighash(input))?;

        let message = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_ecdsa(&message, &self.secret);

        Ok(ecdsa::Signature::sighash_all(signature).to_vec())
    }
}

impl fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WalletKey")
            .field("address", &self.address().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        Amount, OutPoint, Sequence, TxIn, TxOut, Witness, absolute::LockTime,
        transaction::Version,
    };

    fn key(network: Network) -> WalletKey {
        WalletKey::from_secret(SecretKey::from_slice(&[1; 32]).unwrap(), network)
    }

    #[test]
    fn test_address_roundtrip() {
        for network in [Network::Mainnet, Network::Testnet] {
            let address = key(network).address();
            let parsed = Address::parse(&address.to_string(), network).unwrap();

            assert_eq!(parsed, address);
            assert_eq!(parsed.script_pubkey(), address.script_pubkey());
            assert!(parsed.script_pubkey().is_p2pkh());
        }
    }

    #[test]
    fn test_mainnet_address_prefix() {
        assert!(key(Network::Mainnet).address().to_string().starts_with('7'));
    }

    #[test]
    fn test_parse_mainnet_address() {
        let address = Address::parse("7dW5MnhdSNhvhyricJ71ebCFPaxoC3h3HB", Network::Mainnet).unwrap();

        assert_eq!(address.to_string(), "7dW5MnhdSNhvhyricJ71ebCFPaxoC3h3HB");
        assert!(address.script_pubkey().is_p2pkh());
        assert!(matches!(
            Address::parse("7dW5MnhdSNhvhyricJ71ebCFPaxoC3h3HB", Network::Testnet),
            Err(Error::UnknownVersion(0x10, Network::Testnet))
        ));
    }

    #[test]
    fn test_address_wrong_network() {
        let address = key(Network::Mainnet).address().to_string();
        assert!(matches!(
            Address::parse(&address, Network::Testnet),
            Err(Error::UnknownVersion(0x10, Network::Testnet))
        ));
    }

    #[test]
    fn test_address_bad_checksum() {
        let mut address = key(Network::Mainnet).address().to_string();
        let last = address.pop().unwrap();
        address.push(if last == '1' { '2' } else { '1' });

        assert!(matches!(
            Address::parse(&address, Network::Mainnet),
            Err(Error::Base58(_))
        ));
    }

    #[test]
    fn test_script_hash_address() {
        let hash = ScriptHash::hash(b"lock");
        let data = [&[Network::Mainnet.script_hash_prefix()][..], hash.as_byte_array()].concat();
        let encoded = base58::encode_check(&data);

        let address = Address::parse(&encoded, Network::Mainnet).unwrap();
        assert_eq!(address.payload(), Payload::ScriptHash(hash));
        assert!(address.script_pubkey().is_p2sh());
        assert_eq!(address.to_string(), encoded);
    }

    #[test]
    fn test_wif_roundtrip() {
        let original = key(Network::Testnet);
        let parsed = WalletKey::from_wif(&original.to_wif(), Network::Testnet).unwrap();

        assert_eq!(parsed.public_key(), original.public_key());
        assert_eq!(parsed.address(), original.address());
    }

    #[test]
    fn test_uncompressed_wif() {
        let mut data = vec![Network::Mainnet.wif_prefix()];
        data.extend_from_slice(&[1; 32]);
        let wif = base58::encode_check(&data);

        let parsed = WalletKey::from_wif(&wif, Network::Mainnet).unwrap();
        assert!(!parsed.public_key().compressed);
        assert_eq!(parsed.to_wif(), wif);
    }

    #[test]
    fn test_wif_wrong_network() {
        let wif = key(Network::Mainnet).to_wif();
        assert!(matches!(
            WalletKey::from_wif(&wif, Network::Testnet),
            Err(Error::UnknownVersion(_, Network::Testnet))
        ));
    }

    #[test]
    fn test_sign_verifies() {
        let key = key(Network::Mainnet);
        let script_code = key.address().script_pubkey();
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: script_code.clone(),
            }],
        };

        let signature = key.sign(&tx, 0, &script_code).unwrap();
        assert_eq!(*signature.last().unwrap(), EcdsaSighashType::All.to_u32() as u8);

        let parsed = ecdsa::Signature::from_slice(&signature).unwrap();
        let sighash = SighashCache::new(&tx)
            .legacy_signature_hash(0, &script_code, EcdsaSighashType::All.to_u32())
            .unwrap();
        let message = Message::from_digest(sighash.to_byte_array());
        Secp256k1::verification_only()
            .verify_ecdsa(&message, &parsed.signature, &key.public_key().inner)
            .unwrap();
    }

    #[test]
    fn test_sign_out_of_range_input() {
        let key = key(Network::Mainnet);
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };

        assert!(matches!(
            key.sign(&tx, 0, &ScriptBuf::new()),
            Err(Error::Sighash(0))
        ));
    }
}
