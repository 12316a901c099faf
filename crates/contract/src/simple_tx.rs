//! Generic N-in/M-out transaction contract, used on its own and as the commit leg of swaps.

use bitcoin::{
    absolute::LockTime, consensus::encode::serialize_hex, transaction::Version, Amount, Network,
    ScriptBuf, TapSighashType, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use tracing::*;
use utxord_btc_types::{
    fee::{calculate_output_amount, tx_fee, FeeOptions, P2WPKH_VIN_VSIZE, TAPROOT_KEYSPEND_VIN_VSIZE, TAPROOT_VOUT_VSIZE},
    parse_address, sign_destination, verify_input, ContractError, Destination, DestinationRepr,
    KeyRegistry, TxInput, Utxo, UtxoRepr, P2WPKH_DUMMY_SIG_LEN,
};
use utxord_config::Config;

use crate::{
    builder::{CommonParams, ContractBuilder, NAME_MINING_FEE_RATE},
    reconcile, reconcile_inputs, ContractPhase, PhasedContract,
};

pub const NAME_UTXO: &str = "utxo";
pub const NAME_OUTPUTS: &str = "outputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Inputs, outputs and fee rate agreed, nothing signed.
    TxTerms,
    /// Every input carries its witness.
    TxSignature,
}

impl ContractPhase for TxPhase {
    const ALL: &'static [Self] = &[TxPhase::TxTerms, TxPhase::TxSignature];

    fn as_str(&self) -> &'static str {
        match self {
            TxPhase::TxTerms => "TX_TERMS",
            TxPhase::TxSignature => "TX_SIGNATURE",
        }
    }

    fn predecessors(self) -> &'static [Self] {
        match self {
            TxPhase::TxTerms => &[],
            TxPhase::TxSignature => &[TxPhase::TxTerms],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTxParams {
    #[serde(flatten)]
    pub common: CommonParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utxo: Vec<UtxoRepr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<DestinationRepr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleTransaction {
    builder: ContractBuilder,
    inputs: Vec<TxInput>,
    outputs: Vec<Destination>,
    /// Whether the last output is change solved from the fee rate.
    has_change: bool,
}

impl SimpleTransaction {
    pub fn new(network: Network) -> Self {
        Self::with_config(&Config {
            network,
            ..Config::default()
        })
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            builder: ContractBuilder::new(config),
            inputs: Vec::new(),
            outputs: Vec::new(),
            has_change: false,
        }
    }

    pub fn builder(&self) -> &ContractBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut ContractBuilder {
        &mut self.builder
    }

    pub fn set_mining_fee_rate(&mut self, rate: Amount) -> Result<(), ContractError> {
        self.builder.set_mining_fee_rate(rate)
    }

    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Destination] {
        &self.outputs
    }

    pub fn add_input(&mut self, utxo: Utxo) {
        self.inputs.push(TxInput::new(utxo));
    }

    pub fn add_output(&mut self, destination: Destination) -> Result<(), ContractError> {
        if self.has_change {
            return Err(ContractError::State(
                "change must stay the last output, drop it first".into(),
            ));
        }
        self.outputs.push(destination);
        Ok(())
    }

    pub fn set_output_amount(&mut self, nout: usize, amount: Amount) -> Result<(), ContractError> {
        self.outputs
            .get_mut(nout)
            .ok_or_else(|| ContractError::State(format!("no output {nout}")))?
            .set_amount(amount)
    }

    pub fn total_input(&self) -> Amount {
        self.inputs.iter().map(|input| input.utxo.amount()).sum()
    }

    /// Appends an output to `addr` carrying whatever the inputs leave after the other outputs
    /// and the exact mining fee. Change that would be dust is not added.
    pub fn add_change_output(&mut self, addr: &str) -> Result<(), ContractError> {
        let rate = self.builder.require_mining_fee_rate()?;
        if self.has_change {
            self.drop_change_output();
        }

        let address = parse_address(addr, self.builder.network())?;
        let mut change = Destination::from_address(Amount::ZERO, address)?;
        self.outputs.push(change.clone());

        let tx = self.make_tx()?;
        let amount = match calculate_output_amount(self.total_input(), rate, &tx, tx.output.len() - 1) {
            Ok(amount) => amount,
            Err(e) => {
                self.outputs.pop();
                return Err(e);
            }
        };
        change.set_amount(amount)?;
        if self.builder.is_dust(&change) {
            self.outputs.pop();
            warn!(%amount, "change is dust, leaving it to the mining fee");
            return Ok(());
        }
        if let Some(last) = self.outputs.last_mut() {
            *last = change;
        }
        self.has_change = true;
        Ok(())
    }

    pub fn has_change(&self) -> bool {
        self.has_change
    }

    /// Removes the last output, change or not.
    pub fn remove_last_output(&mut self) -> Option<Destination> {
        self.has_change = false;
        self.outputs.pop()
    }

    pub fn drop_change_output(&mut self) {
        if self.has_change {
            self.outputs.pop();
            self.has_change = false;
        }
    }

    pub fn change_output(&self) -> Result<Option<Utxo>, ContractError> {
        if !self.has_change {
            return Ok(None);
        }
        let nout = self.outputs.len() - 1;
        self.output_utxo(nout).map(Some)
    }

    /// Output `nout` of this transaction as a spendable [`Utxo`].
    pub fn output_utxo(&self, nout: usize) -> Result<Utxo, ContractError> {
        let destination = self
            .outputs
            .get(nout)
            .cloned()
            .ok_or_else(|| ContractError::State(format!("no output {nout}")))?;
        Ok(Utxo::new(self.txid()?, nout as u32, destination))
    }

    fn prevouts(&self) -> Result<Vec<TxOut>, ContractError> {
        self.inputs.iter().map(|input| input.utxo.tx_out()).collect()
    }

    /// Transaction with the gathered witnesses, or placeholders where none are gathered yet.
    pub fn make_tx(&self) -> Result<Transaction, ContractError> {
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(TxInput::to_txin)
                .collect::<Result<_, _>>()?,
            output: self
                .outputs
                .iter()
                .filter_map(Destination::tx_out)
                .collect(),
        })
    }

    pub fn txid(&self) -> Result<Txid, ContractError> {
        Ok(self.make_tx()?.compute_txid())
    }

    pub fn raw_transactions(&self) -> Result<Vec<String>, ContractError> {
        Ok(vec![serialize_hex(&self.make_tx()?)])
    }

    /// Signs every input with the keys `registry` resolves for the spent outputs.
    pub fn sign(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        let tx = self.make_tx()?;
        let prevouts = self.prevouts()?;
        for (nin, input) in self.inputs.iter_mut().enumerate() {
            let witness = sign_destination(
                registry,
                filter,
                &input.utxo.destination,
                &tx,
                nin,
                &prevouts,
                TapSighashType::Default,
            )?;
            input.witness.merge(&witness)?;
        }
        info!(txid = %tx.compute_txid(), inputs = self.inputs.len(), "transaction signed");
        Ok(())
    }

    pub fn check_sig(&self) -> Result<(), ContractError> {
        let tx = self.make_tx()?;
        let prevouts = self.prevouts()?;
        for nin in 0..self.inputs.len() {
            verify_input(&tx, nin, &prevouts)
                .map_err(|e| ContractError::Signature(format!("{NAME_UTXO}[{nin}]")).caused_by(e))?;
        }
        Ok(())
    }

    /// Mining fee of the transaction as currently shaped, extended by `options`.
    ///
    /// With no inputs yet a single taproot key-path (or P2WPKH) input is assumed.
    pub fn calculate_whole_fee(&self, options: &str) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let opts: FeeOptions = options.parse()?;
        let input_vsize = if opts.p2wpkh_utxo {
            P2WPKH_VIN_VSIZE
        } else {
            TAPROOT_KEYSPEND_VIN_VSIZE
        };

        let mut tx = self.make_tx()?;
        if tx.input.is_empty() {
            let witness = if opts.p2wpkh_utxo {
                Witness::from_slice(&[vec![0; P2WPKH_DUMMY_SIG_LEN], vec![0; 33]])
            } else {
                Witness::from_slice(&[vec![0; 64]])
            };
            tx.input.push(TxIn {
                witness,
                ..TxIn::default()
            });
        }
        let mut vsize = tx.vsize();
        if opts.extra_utxo {
            vsize += input_vsize;
        }
        if opts.change && !self.has_change {
            vsize += TAPROOT_VOUT_VSIZE;
        }
        Ok(tx_fee(rate, vsize))
    }

    pub fn get_min_funding_amount(&self, options: &str) -> Result<Amount, ContractError> {
        let paid: Amount = self
            .outputs
            .iter()
            .take(self.outputs.len() - usize::from(self.has_change))
            .map(Destination::amount)
            .sum();
        Ok(paid + self.calculate_whole_fee(options)?)
    }

    pub fn tx_params(&self, phase: TxPhase) -> SimpleTxParams {
        let with_witness = phase == TxPhase::TxSignature;
        SimpleTxParams {
            common: self.builder.make_params(true, false, false),
            utxo: self
                .inputs
                .iter()
                .map(|input| input.to_repr(with_witness))
                .collect(),
            outputs: self.outputs.iter().map(Destination::to_repr).collect(),
        }
    }

    pub fn merge_tx_params(&mut self, params: SimpleTxParams) -> Result<(), ContractError> {
        let network = self.builder.network();
        self.builder.merge_params(params.common)?;

        let inputs = params
            .utxo
            .into_iter()
            .map(|repr| TxInput::from_repr(repr, network))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ContractError::TermWrongValue(NAME_UTXO.into()).caused_by(e))?;
        reconcile_inputs(&mut self.inputs, inputs, NAME_UTXO)?;

        if !params.outputs.is_empty() {
            let outputs = params
                .outputs
                .into_iter()
                .map(|repr| Destination::from_repr(repr, network))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ContractError::TermWrongValue(NAME_OUTPUTS.into()).caused_by(e))?;
            let mut known = (!self.outputs.is_empty()).then(|| self.outputs.clone());
            reconcile(&mut known, Some(outputs), NAME_OUTPUTS)?;
            self.outputs = known.unwrap_or_default();
        }
        Ok(())
    }

    pub fn check_terms(&self, phase: TxPhase) -> Result<(), ContractError> {
        match phase {
            TxPhase::TxTerms => {
                if self.builder.mining_fee_rate().is_none() {
                    return Err(ContractError::TermMissing(NAME_MINING_FEE_RATE.into()));
                }
                if self.inputs.is_empty() {
                    return Err(ContractError::TermMissing(NAME_UTXO.into()));
                }
                if self.outputs.is_empty() {
                    return Err(ContractError::TermMissing(NAME_OUTPUTS.into()));
                }
                for (i, out) in self.outputs.iter().enumerate() {
                    self.builder.check_dust(out, &format!("{NAME_OUTPUTS}[{i}]"))?;
                }
                Ok(())
            }
            TxPhase::TxSignature => {
                for (nin, input) in self.inputs.iter().enumerate() {
                    if !input.witness.is_complete() {
                        return Err(ContractError::TermMissing(format!("{NAME_UTXO}[{nin}].witness")));
                    }
                }
                Ok(())
            }
        }
    }

    /// Script paying to output `nout`, for callers chaining on this transaction.
    pub fn output_script(&self, nout: usize) -> Option<ScriptBuf> {
        self.outputs.get(nout).and_then(Destination::script_pubkey)
    }
}

impl PhasedContract for SimpleTransaction {
    type Phase = TxPhase;
    type Params = SimpleTxParams;

    const CONTRACT_TYPE: &'static str = "transaction";
    const PROTOCOL_VERSION: u32 = 1;
    const SUPPORTED_VERSIONS: &'static [u32] = &[1];

    fn make_params(&self, _version: u32, phase: TxPhase) -> Result<SimpleTxParams, ContractError> {
        Ok(self.tx_params(phase))
    }

    fn merge_params(&mut self, params: SimpleTxParams, _version: u32, _phase: TxPhase) -> Result<(), ContractError> {
        self.merge_tx_params(params)
    }

    fn check_phase_terms(&self, _version: u32, phase: TxPhase) -> Result<(), ContractError> {
        self.check_terms(phase)
    }

    fn check_phase_signatures(&self, phase: TxPhase) -> Result<(), ContractError> {
        match phase {
            TxPhase::TxTerms => Ok(()),
            TxPhase::TxSignature => self.check_sig(),
        }
    }
}

#[cfg(test)]
mod tests {
    use utxord_btc_types::{fee::paid_fee, ErrorKind};
    use utxord_test_utils::{fake_txid, p2tr_address, p2wpkh_address, test_key_cache, TestKey};

    use super::*;

    fn funded(amount: u64) -> SimpleTransaction {
        let mut tx = SimpleTransaction::new(Network::Regtest);
        tx.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
        tx.add_input(Utxo::new(
            fake_txid(1),
            0,
            Destination::from_address(Amount::from_sat(amount), p2tr_address(TestKey::Funds))
                .expect("p2tr"),
        ));
        tx
    }

    #[test]
    fn test_change_pays_exact_fee() {
        let mut tx = funded(20_000);
        tx.add_output(
            Destination::from_address(Amount::from_sat(5_000), p2tr_address(TestKey::Ord))
                .expect("p2tr"),
        )
        .expect("output");
        tx.add_change_output(&p2tr_address(TestKey::Change).to_string())
            .expect("change");

        let built = tx.make_tx().expect("tx");
        assert_eq!(built.output.len(), 2);
        assert_eq!(built.vsize(), 154);
        assert_eq!(paid_fee(tx.total_input(), &built), Some(Amount::from_sat(154)));
        assert!(tx.change_output().expect("change").is_some());
    }

    #[test]
    fn test_dust_change_is_dropped() {
        let mut tx = funded(5_400);
        tx.add_output(
            Destination::from_address(Amount::from_sat(5_000), p2tr_address(TestKey::Ord))
                .expect("p2tr"),
        )
        .expect("output");
        tx.add_change_output(&p2tr_address(TestKey::Change).to_string())
            .expect("change is dropped, not an error");
        assert_eq!(tx.outputs().len(), 1);
        assert!(tx.change_output().expect("no change").is_none());
    }

    #[test]
    fn test_change_without_funds_fails() {
        let mut tx = funded(1_000);
        tx.add_output(
            Destination::from_address(Amount::from_sat(5_000), p2tr_address(TestKey::Ord))
                .expect("p2tr"),
        )
        .expect("output");
        let err = tx
            .add_change_output(&p2tr_address(TestKey::Change).to_string())
            .expect_err("not enough funds");
        assert_eq!(err.kind(), ErrorKind::FundsNotEnough);
        assert_eq!(tx.outputs().len(), 1);
    }

    #[test]
    fn test_whole_fee_assumes_one_input() {
        let mut tx = SimpleTransaction::new(Network::Regtest);
        tx.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
        for _ in 0..3 {
            tx.add_output(
                Destination::from_address(Amount::from_sat(546), p2tr_address(TestKey::Funds))
                    .expect("p2tr"),
            )
            .expect("output");
        }
        assert_eq!(tx.calculate_whole_fee(""), Ok(Amount::from_sat(197)));
        assert_eq!(tx.calculate_whole_fee("change"), Ok(Amount::from_sat(240)));
        assert_eq!(tx.get_min_funding_amount(""), Ok(Amount::from_sat(546 * 3 + 197)));
        assert!(tx.calculate_whole_fee("bogus").is_err());
    }

    #[test]
    fn test_whole_fee_quoted_at_configured_rate() {
        let mut config = Config::default();
        config.fees.default_mining_fee_rate = Amount::from_sat(2000);
        let mut tx = SimpleTransaction::with_config(&config);
        tx.add_output(
            Destination::from_address(Amount::from_sat(546), p2tr_address(TestKey::Ord)).expect("p2tr"),
        )
        .expect("output");

        // one taproot input and one taproot output
        assert_eq!(tx.calculate_whole_fee(""), Ok(Amount::from_sat(222)));
        assert!(tx.check_terms(TxPhase::TxTerms).is_err(), "quotes do not agree a rate");

        tx.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
        assert_eq!(tx.calculate_whole_fee(""), Ok(Amount::from_sat(111)));
    }

    #[test]
    fn test_whole_fee_estimate_matches_funded_tx() {
        for (option, addr) in [
            ("", p2tr_address(TestKey::Funds)),
            ("p2wpkh_utxo", p2wpkh_address(TestKey::Funds)),
        ] {
            let mut tx = SimpleTransaction::new(Network::Regtest);
            tx.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
            tx.add_output(
                Destination::from_address(Amount::from_sat(546), p2tr_address(TestKey::Ord)).expect("p2tr"),
            )
            .expect("output");
            let estimate = tx.calculate_whole_fee(option).expect("estimate");

            let funds = Destination::from_address(Amount::from_sat(10_000), addr).expect("funds");
            tx.add_input(Utxo::new(fake_txid(1), 0, funds));
            let exact = tx_fee(Amount::from_sat(1000), tx.make_tx().expect("tx").vsize());
            assert_eq!(estimate, exact, "{option:?}");
            assert_eq!(tx.calculate_whole_fee(option), Ok(exact), "{option:?}");
        }
    }

    #[test]
    fn test_sign_and_exchange() {
        let keys = test_key_cache();
        let mut tx = funded(20_000);
        tx.add_input(Utxo::new(
            fake_txid(2),
            1,
            Destination::from_address(Amount::from_sat(10_000), p2wpkh_address(TestKey::Funds))
                .expect("p2wpkh"),
        ));
        tx.add_output(
            Destination::from_address(Amount::from_sat(25_000), p2tr_address(TestKey::Ord))
                .expect("p2tr"),
        )
        .expect("output");
        tx.add_change_output(&p2tr_address(TestKey::Change).to_string())
            .expect("change");

        let terms = tx.serialize(1, TxPhase::TxTerms).expect("terms");
        let mut counterpart = SimpleTransaction::new(Network::Regtest);
        counterpart.deserialize(&terms, TxPhase::TxTerms).expect("terms merge");
        assert_eq!(counterpart.txid(), tx.txid());

        tx.sign(&keys, "").expect("sign");
        tx.check_sig().expect("signatures verify");

        let signed = tx.serialize(1, TxPhase::TxSignature).expect("signed");
        counterpart.deserialize(&signed, TxPhase::TxSignature).expect("signature merge");
        assert_eq!(counterpart.raw_transactions(), tx.raw_transactions());

        let err = SimpleTransaction::new(Network::Regtest)
            .serialize(1, TxPhase::TxTerms)
            .expect_err("empty transaction");
        assert_eq!(err.kind(), ErrorKind::TermMissing);
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let keys = test_key_cache();
        let mut tx = funded(20_000);
        tx.add_output(
            Destination::from_address(Amount::from_sat(15_000), p2tr_address(TestKey::Ord))
                .expect("p2tr"),
        )
        .expect("output");
        tx.sign(&keys, "").expect("sign");

        let mut json: serde_json::Value =
            serde_json::from_str(&tx.serialize(1, TxPhase::TxSignature).expect("signed")).expect("json");
        let sig = json["params"]["utxo"][0]["witness"][0]
            .as_str()
            .expect("hex signature")
            .to_owned();
        let flipped = format!("{}{}", if sig.starts_with('0') { "1" } else { "0" }, &sig[1..]);
        json["params"]["utxo"][0]["witness"][0] = flipped.into();

        let mut counterpart = SimpleTransaction::new(Network::Regtest);
        let err = counterpart
            .deserialize(&json.to_string(), TxPhase::TxSignature)
            .expect_err("bad signature");
        assert_eq!(err.kind(), ErrorKind::Signature);
        assert!(counterpart.inputs().is_empty(), "nothing merged");
    }
}
