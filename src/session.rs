//! Commands that move money from one wallet file

use crate::{
    Error, Result,
    address::{Address, Network, WalletKey},
    broadcast::{Broadcaster, NodeRpc, PendingFile, RetryPolicy},
    chain::ChainBuilder,
    funding::{self, FeeRate, TxDraft},
    wallet::{Wallet, WalletFile},
};
use bitcoin::{Amount, Transaction, TxOut, Txid};
use std::{fs, path::Path};
use tracing::info;

/// Commands sharing a wallet file, its pending file and a node
pub struct Session<'a, R: NodeRpc + ?Sized> {
    rpc: &'a R,
    wallet: WalletFile,
    pending: PendingFile,
    network: Network,
    fee_rate: FeeRate,
    policy: RetryPolicy,
}

impl<'a, R: NodeRpc + ?Sized> Session<'a, R> {
    /// Creates a session over `wallet` with its pending file alongside
    pub fn new(rpc: &'a R, wallet: WalletFile, network: Network) -> Self {
        let pending = PendingFile::for_wallet(wallet.path());
        Self {
            rpc,
            wallet,
            pending,
            network,
            fee_rate: FeeRate::default(),
            policy: RetryPolicy::mempool_chain(),
        }
    }

    /// Sets the fee rate
    pub fn with_fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Sets the retry policy used when retry is requested
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parses an address on the session's network
    pub fn address(&self, s: &str) -> Result<Address> {
        Ok(Address::parse(s, self.network)?)
    }

    fn broadcaster(&self) -> Broadcaster<'_, R> {
        Broadcaster::new(self.rpc, &self.wallet, &self.pending, self.network)
            .with_policy(self.policy)
    }

    fn load(&self) -> Result<(Wallet, WalletKey)> {
        let wallet = self.wallet.load()?;
        let key = wallet.key(self.network)?;
        Ok((wallet, key))
    }

    /// The current wallet
    pub fn wallet(&self) -> Result<Wallet> {
        self.wallet.load()
    }

    /// Pays `amount` to `to`, or sweeps the whole balance there when `amount` is `None`
    pub fn send(&self, to: &Address, amount: Option<u64>) -> Result<Txid> {
        let (wallet, key) = self.load()?;
        if wallet.balance() == 0 {
            return Err(Error::Validation("no funds to send".into()));
        }

        let mut draft = TxDraft::new();
        match amount {
            Some(amount) => {
                draft.add_output(TxOut {
                    value: Amount::from_sat(amount),
                    script_pubkey: to.script_pubkey(),
                });
                funding::fund(&wallet, &key, &mut draft, self.fee_rate)?;
            }
            None => {
                funding::sweep(&wallet, &key, &mut draft, &to.script_pubkey(), self.fee_rate)?
            }
        }

        self.submit(draft.into_transaction())
    }

    /// Splits the balance into `parts` outputs to the wallet itself: `parts - 1` of
    /// equal value and the remainder as change
    pub fn split(&self, parts: u64) -> Result<Txid> {
        if parts == 0 {
            return Err(Error::Validation("split count must be at least 1".into()));
        }

        let (wallet, key) = self.load()?;
        let balance = wallet.balance();
        if balance == 0 {
            return Err(Error::Validation("no funds to split".into()));
        }

        let own = key.address().script_pubkey();
        let mut draft = TxDraft::new();
        for _ in 1..parts {
            draft.add_output(TxOut {
                value: Amount::from_sat(balance / parts),
                script_pubkey: own.clone(),
            });
        }
        funding::sweep(&wallet, &key, &mut draft, &own, self.fee_rate)?;

        self.submit(draft.into_transaction())
    }

    /// Merges every output into one. Returns `None` when there is nothing to merge.
    pub fn consolidate(&self) -> Result<Option<Txid>> {
        let (wallet, key) = self.load()?;
        if wallet.utxos.is_empty() {
            return Err(Error::Validation("no funds to consolidate".into()));
        }
        if wallet.utxos.len() == 1 {
            return Ok(None);
        }

        info!(
            count = wallet.utxos.len(),
            balance = wallet.balance(),
            "consolidating outputs"
        );
        let own = key.address().script_pubkey();
        let mut draft = TxDraft::new();
        funding::sweep(&wallet, &key, &mut draft, &own, self.fee_rate)?;

        self.submit(draft.into_transaction()).map(Some)
    }

    fn submit(&self, tx: Transaction) -> Result<Txid> {
        self.broadcaster().broadcast(&tx, true)?;
        Ok(tx.compute_txid())
    }

    /// Rebroadcasts pending transactions without retry. Returns false if there were
    /// none.
    pub fn resume_pending(&self) -> Result<bool> {
        self.broadcaster().resume()
    }

    /// Builds and broadcasts an inscription chain, returning the inscription id:
    /// the first transaction carrying a reveal.
    pub fn inscribe(
        &self,
        destination: &Address,
        content_type: &str,
        payload: &[u8],
        retry: bool,
    ) -> Result<Txid> {
        let (mut wallet, key) = self.load()?;
        let chain = ChainBuilder::new(&key).fee_rate(self.fee_rate).build(
            &mut wallet,
            destination,
            content_type.as_bytes(),
            payload,
        )?;

        let inscription = chain
            .get(1)
            .map(|built| built.txid())
            .ok_or_else(|| Error::Validation("chain has no reveal transaction".into()))?;
        let txs: Vec<Transaction> = chain.into_iter().map(|built| built.transaction).collect();

        self.broadcaster().broadcast_all(&txs, retry)?;
        info!(%inscription, "inscribed");
        Ok(inscription)
    }

    /// Inscribes the contents of a file under the content type guessed from its name
    pub fn inscribe_file(&self, destination: &Address, path: &Path) -> Result<Txid> {
        let payload = fs::read(path)?;
        if payload.is_empty() {
            return Err(Error::Validation("no data to mint".into()));
        }

        self.inscribe(destination, &content_type_for(path), &payload, false)
    }
}

/// Content type for a file name. Text and JSON types carry a UTF-8 charset.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let textual = mime.type_() == mime_guess::mime::TEXT
        || mime.subtype() == mime_guess::mime::JSON
        || mime.subtype() == mime_guess::mime::JAVASCRIPT;

    if textual && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder,
        testing::{self, ChainIndexer, MockRpc},
    };
    use bitcoin::consensus;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        rpc: MockRpc,
    }

    impl Fixture {
        fn new(values: &[u64]) -> Self {
            Self::with_rpc(values, MockRpc::default())
        }

        fn with_rpc(values: &[u64], rpc: MockRpc) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let key = testing::key();
            WalletFile::new(dir.path().join(".wallet.json"))
                .save(&testing::funded_wallet(&key, values))
                .unwrap();

            Self { dir, rpc }
        }

        fn session(&self) -> Session<'_, MockRpc> {
            Session::new(
                &self.rpc,
                WalletFile::new(self.dir.path().join(".wallet.json")),
                testing::NETWORK,
            )
            .with_policy(RetryPolicy {
                interval: Duration::from_millis(1),
                ..RetryPolicy::mempool_chain()
            })
        }

        fn sent(&self) -> Vec<Transaction> {
            self.rpc
                .sent()
                .iter()
                .map(|tx| consensus::deserialize(&hex::decode(tx).unwrap()).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_send_amount() {
        let f = Fixture::new(&[1_000_000, 2_000_000]);
        let to = testing::other_key().address();

        let txid = f.session().send(&to, Some(1_500_000)).unwrap();

        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].compute_txid(), txid);
        assert_eq!(sent[0].output[0].value, Amount::from_sat(1_500_000));
        assert_eq!(sent[0].output[0].script_pubkey, to.script_pubkey());

        let wallet = f.session().wallet().unwrap();
        assert_eq!(wallet.utxos.len(), 1);
        assert_eq!(wallet.utxos[0].txid, txid);
    }

    #[test]
    fn test_send_everything() {
        let f = Fixture::new(&[1_000_000, 2_000_000]);
        let to = testing::other_key().address();

        f.session().send(&to, None).unwrap();

        let sent = f.sent();
        assert_eq!(sent[0].input.len(), 2);
        assert_eq!(sent[0].output.len(), 1);
        assert_eq!(sent[0].output[0].script_pubkey, to.script_pubkey());
        assert!(f.session().wallet().unwrap().utxos.is_empty());
    }

    #[test]
    fn test_send_without_funds() {
        let f = Fixture::new(&[]);
        let to = testing::other_key().address();

        assert!(matches!(
            f.session().send(&to, Some(1)),
            Err(Error::Validation(_))
        ));
        assert_eq!(f.rpc.calls(), 0);
    }

    #[test]
    fn test_split() {
        let f = Fixture::new(&[9_000_000]);

        f.session().split(3).unwrap();

        let tx = &f.sent()[0];
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value, Amount::from_sat(3_000_000));
        assert_eq!(tx.output[1].value, Amount::from_sat(3_000_000));
        assert!(tx.output[2].value < Amount::from_sat(3_000_000));
        assert_eq!(f.session().wallet().unwrap().utxos.len(), 3);
    }

    #[test]
    fn test_consolidate() {
        let f = Fixture::new(&[1_000_000, 2_000_000, 3_000_000]);

        let txid = f.session().consolidate().unwrap().unwrap();

        let wallet = f.session().wallet().unwrap();
        assert_eq!(wallet.utxos.len(), 1);
        assert_eq!(wallet.utxos[0].txid, txid);
        assert_eq!(f.session().consolidate().unwrap(), None);
    }

    #[test]
    fn test_inscribe_broadcasts_decodable_chain() {
        let f = Fixture::new(&[50_000_000]);
        let destination = testing::other_key().address();
        let payload: Vec<u8> = (0..2500).map(|i| (i % 97) as u8).collect();

        let inscription = f
            .session()
            .inscribe(&destination, "image/png", &payload, false)
            .unwrap();

        let sent = f.sent();
        assert!(sent.len() > 2);
        assert_eq!(sent[1].compute_txid(), inscription);
        assert!(!f.session().pending.exists());

        let indexer = ChainIndexer::from_transactions(&sent);
        let decoded = decoder::extract(&indexer, &inscription.to_string()).unwrap();
        assert_eq!(decoded.content_type, "image/png");
        assert_eq!(decoded.data, payload);

        // Only change remains in the wallet file
        let wallet = f.session().wallet().unwrap();
        assert!(wallet.utxos.iter().all(|utxo| utxo.txid != testing::utxo_txid(0)));
        assert!(wallet.balance() < 50_000_000 - 100_000);
    }

    #[test]
    fn test_inscribe_failure_then_resume() {
        let rpc = MockRpc::new(vec![
            Ok(()),
            Err(crate::broadcast::RpcError::rejected(-26, "min relay fee not met")),
        ]);
        let f = Fixture::with_rpc(&[50_000_000], rpc);
        let destination = testing::other_key().address();

        let result = f.session().inscribe(&destination, "text/plain", b"hello", true);
        assert!(matches!(result, Err(Error::Broadcast { index: 1, .. })));
        assert_eq!(f.session().pending.load().unwrap().len(), 1);

        assert!(f.session().resume_pending().unwrap());
        assert!(!f.session().resume_pending().unwrap());
        assert_eq!(f.rpc.calls(), 3);
    }

    #[test]
    fn test_inscribe_file() {
        let f = Fixture::new(&[50_000_000]);
        let destination = testing::other_key().address();

        let empty = f.dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            f.session().inscribe_file(&destination, &empty),
            Err(Error::Validation(_))
        ));

        let file = f.dir.path().join("note.txt");
        fs::write(&file, b"gm").unwrap();
        f.session().inscribe_file(&destination, &file).unwrap();
        assert_eq!(f.rpc.calls(), 2);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for(Path::new("a.txt")), "text/plain; charset=utf-8");
        assert_eq!(
            content_type_for(Path::new("a.json")),
            "application/json; charset=utf-8"
        );
        assert_eq!(
            content_type_for(Path::new("a.unknownext")),
            "application/octet-stream"
        );
    }
}
