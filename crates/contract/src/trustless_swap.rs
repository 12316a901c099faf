//! Ordinal swap enforced by script alone.
//!
//! The seller commits the ordinal under a `seller ∧ market` 2-of-2 leaf and signs its half of
//! the swap with `SIGHASH_SINGLE|ANYONECANPAY`, which pins the price output without pinning
//! anything else. The buyer then funds the swap either through a commit transaction built here
//! (`commit_funds`) or with ready-made UTXOs, the market co-signs the ordinal input and the
//! buyer signs the funding inputs last.
//!
//! Swap inputs are `[ord]` while only the seller has signed, `[brick1, brick2, ord, main…]`
//! once funded. Outputs of the funded shape are `[bricks → market fee or change, ord → ord
//! payoff, price → funds payoff, market fee?, change?]`.

use bitcoin::{
    absolute::LockTime, consensus::encode::serialize_hex, secp256k1::XOnlyPublicKey,
    transaction::Version, Address, Amount, Network, ScriptBuf, TapSighashType, Transaction, TxOut,
    Txid,
};
use serde::{Deserialize, Serialize};
use tracing::*;
use utxord_btc_types::{
    fee::{
        calculate_output_amount, dust_limit, tx_fee, FeeOptions, P2WPKH_VIN_VSIZE, TAPROOT_KEYSPEND_VIN_VSIZE,
        TAPROOT_VOUT_VSIZE, TX_BASE_VSIZE, TX_SWAP_BASE_VSIZE,
    },
    is_placeholder, parse_address, sign_destination, sign_taproot, verify_input, verify_taproot_signature,
    ContractError, Destination, KeyRegistry, TxInput, Utxo, UtxoRepr, WitnessStack,
};
use utxord_config::Config;
use utxord_taproot::{multisig_2of2, TaprootCommitment};

use crate::{
    builder::{CommonParams, ContractBuilder, NAME_CHANGE_ADDR, NAME_MARKET_FEE, NAME_MINING_FEE_RATE},
    reconcile, reconcile_input, reconcile_inputs,
    simple_tx::{SimpleTransaction, SimpleTxParams, TxPhase},
    ContractPhase, PhasedContract,
};

pub const NAME_ORD_PRICE: &str = "ord_price";
pub const NAME_ORD_COMMIT: &str = "ord_commit";
pub const NAME_MARKET_SCRIPT_PK: &str = "market_script_pk";
pub const NAME_ORD_SCRIPT_PK: &str = "ord_script_pk";
pub const NAME_ORD_INT_PK: &str = "ord_int_pk";
pub const NAME_ORD_PAYOFF_ADDR: &str = "ord_payoff_addr";
pub const NAME_FUNDS_PAYOFF_ADDR: &str = "funds_payoff_addr";
pub const NAME_FUNDS: &str = "funds";
pub const NAME_SWAP_INPUTS: &str = "swap_inputs";

/// Index of the ordinal among the inputs of a funded swap.
const FUNDED_ORD_INDEX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustlessSwapPhase {
    OrdTerms,
    OrdSwapSig,
    FundsTerms,
    FundsCommitSig,
    FundsSwapTerms,
    FundsSwapSig,
}

impl ContractPhase for TrustlessSwapPhase {
    const ALL: &'static [Self] = &[
        TrustlessSwapPhase::OrdTerms,
        TrustlessSwapPhase::OrdSwapSig,
        TrustlessSwapPhase::FundsTerms,
        TrustlessSwapPhase::FundsCommitSig,
        TrustlessSwapPhase::FundsSwapTerms,
        TrustlessSwapPhase::FundsSwapSig,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            TrustlessSwapPhase::OrdTerms => "ORD_TERMS",
            TrustlessSwapPhase::OrdSwapSig => "ORD_SWAP_SIG",
            TrustlessSwapPhase::FundsTerms => "FUNDS_TERMS",
            TrustlessSwapPhase::FundsCommitSig => "FUNDS_COMMIT_SIG",
            TrustlessSwapPhase::FundsSwapTerms => "FUNDS_SWAP_TERMS",
            TrustlessSwapPhase::FundsSwapSig => "FUNDS_SWAP_SIG",
        }
    }

    fn predecessors(self) -> &'static [Self] {
        use TrustlessSwapPhase::*;
        match self {
            OrdTerms | FundsTerms => &[],
            OrdSwapSig => &[OrdTerms],
            FundsCommitSig => &[FundsTerms],
            FundsSwapTerms => &[OrdSwapSig, FundsCommitSig],
            FundsSwapSig => &[FundsSwapTerms],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustlessSwapParams {
    #[serde(flatten)]
    pub common: CommonParams,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bitcoin::amount::serde::as_sat::opt"
    )]
    pub ord_price: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_script_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_script_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_int_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funds_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_commit: Option<SimpleTxParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funds: Option<SimpleTxParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub swap_inputs: Vec<UtxoRepr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustlessSwapBuilder {
    builder: ContractBuilder,
    ord_price: Option<Amount>,
    market_script_pk: Option<XOnlyPublicKey>,
    ord_script_pk: Option<XOnlyPublicKey>,
    ord_int_pk: Option<XOnlyPublicKey>,
    funds_payoff_addr: Option<Address>,
    ord_payoff_addr: Option<Address>,
    ord_commit: Option<SimpleTransaction>,
    funds_commit: Option<SimpleTransaction>,
    ord_input: Option<TxInput>,
    brick1: Option<TxInput>,
    brick2: Option<TxInput>,
    main_inputs: Vec<TxInput>,
}

fn prevouts(inputs: &[TxInput]) -> Result<Vec<TxOut>, ContractError> {
    inputs.iter().map(|input| input.utxo.tx_out()).collect()
}

fn ord_index(input_count: usize) -> usize {
    if input_count == 1 {
        0
    } else {
        FUNDED_ORD_INDEX
    }
}

fn required<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T, ContractError> {
    value
        .as_ref()
        .ok_or_else(|| ContractError::State(format!("{name} not defined")))
}

fn missing<T>(value: &Option<T>, name: &str) -> Result<(), ContractError> {
    match value {
        Some(_) => Ok(()),
        None => Err(ContractError::TermMissing(name.to_owned())),
    }
}

impl TrustlessSwapBuilder {
    pub fn new(network: Network) -> Self {
        Self::with_config(&Config {
            network,
            ..Config::default()
        })
    }

    pub fn with_config(config: &Config) -> Self {
        Self {
            builder: ContractBuilder::new(config),
            ord_price: None,
            market_script_pk: None,
            ord_script_pk: None,
            ord_int_pk: None,
            funds_payoff_addr: None,
            ord_payoff_addr: None,
            ord_commit: None,
            funds_commit: None,
            ord_input: None,
            brick1: None,
            brick2: None,
            main_inputs: Vec::new(),
        }
    }

    pub fn builder(&self) -> &ContractBuilder {
        &self.builder
    }

    pub fn set_mining_fee_rate(&mut self, rate: Amount) -> Result<(), ContractError> {
        self.builder.set_mining_fee_rate(rate)
    }

    pub fn set_market_fee(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        self.builder.set_market_fee(amount, addr)
    }

    pub fn set_change_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        self.builder.set_change_addr(addr)
    }

    pub fn set_ord_price(&mut self, price: Amount) -> Result<(), ContractError> {
        reconcile(&mut self.ord_price, Some(price), NAME_ORD_PRICE)
    }

    pub fn set_market_script_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.market_script_pk, Some(pk), NAME_MARKET_SCRIPT_PK)?;
        self.try_build_ord_commit()
    }

    /// Seller key of the 2-of-2 leaf. Together with the internal key it completes the ordinal
    /// commitment.
    pub fn set_ord_script_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.ord_script_pk, Some(pk), NAME_ORD_SCRIPT_PK)?;
        self.try_build_ord_commit()
    }

    pub fn set_ord_int_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.ord_int_pk, Some(pk), NAME_ORD_INT_PK)?;
        self.try_build_ord_commit()
    }

    pub fn set_funds_payoff_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        let addr = parse_address(addr, self.builder.network())?;
        reconcile(&mut self.funds_payoff_addr, Some(addr), NAME_FUNDS_PAYOFF_ADDR)
    }

    pub fn set_ord_payoff_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        let addr = parse_address(addr, self.builder.network())?;
        reconcile(&mut self.ord_payoff_addr, Some(addr), NAME_ORD_PAYOFF_ADDR)
    }

    pub fn ord_price(&self) -> Option<Amount> {
        self.ord_price
    }

    pub fn ord_commit(&self) -> Option<&SimpleTransaction> {
        self.ord_commit.as_ref()
    }

    pub fn funds_commit(&self) -> Option<&SimpleTransaction> {
        self.funds_commit.as_ref()
    }

    fn market_fee_amount(&self) -> Result<Amount, ContractError> {
        Ok(self.builder.require_market_fee()?.amount())
    }

    /// The 2-of-2 leaf and the commitment of the ordinal output.
    pub fn ord_swap_commitment(&self) -> Result<(ScriptBuf, TaprootCommitment), ContractError> {
        let ord_pk = required(&self.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
        let market_pk = required(&self.market_script_pk, NAME_MARKET_SCRIPT_PK)?;
        let int_pk = required(&self.ord_int_pk, NAME_ORD_INT_PK)?;

        let script = multisig_2of2(ord_pk, market_pk);
        let commitment = TaprootCommitment::new(*int_pk, [script.clone()]);
        Ok((script, commitment))
    }

    /// Starts the ordinal commit transaction spending the ordinal UTXO.
    pub fn commit_ordinal(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let rate = self.builder.require_mining_fee_rate()?;
        if self.ord_commit.is_some() {
            return Err(ContractError::State(format!("{NAME_ORD_COMMIT} already defined")));
        }
        let network = self.builder.network();
        let destination = Destination::from_addr_str(amount, addr, network)
            .map_err(|e| ContractError::TermWrongValue(format!("{NAME_ORD_COMMIT}[ord]")).caused_by(e))?;

        let mut commit = SimpleTransaction::with_config(self.builder.config());
        commit.set_mining_fee_rate(rate)?;
        commit.add_input(Utxo::new(txid, nout, destination));
        self.ord_commit = Some(commit);
        Ok(())
    }

    /// Adds a UTXO paying the ordinal commit fee, with the address its change goes to.
    ///
    /// Until the seller keys are known the change address is held by a zero-amount output.
    pub fn fund_commit_ordinal(
        &mut self,
        txid: Txid,
        nout: u32,
        amount: Amount,
        addr: &str,
        change_addr: &str,
    ) -> Result<(), ContractError> {
        self.builder.require_mining_fee_rate()?;
        if self.ord_input.is_some() {
            return Err(ContractError::State(format!("{NAME_ORD_COMMIT} is already built")));
        }
        let network = self.builder.network();
        let commit = self.ord_commit.as_mut().ok_or_else(|| {
            ContractError::State(format!("{NAME_ORD_COMMIT} not defined, commit the ordinal first"))
        })?;

        let name = format!("{NAME_ORD_COMMIT}[{}]", commit.inputs().len());
        let destination = Destination::from_addr_str(amount, addr, network)
            .map_err(|e| ContractError::TermWrongValue(name.clone()).caused_by(e))?;
        let change = Destination::from_addr_str(Amount::ZERO, change_addr, network)
            .map_err(|e| ContractError::TermWrongValue(name).caused_by(e))?;

        commit.add_input(Utxo::new(txid, nout, destination));
        while commit.remove_last_output().is_some() {}
        commit.add_output(change)?;

        self.try_build_ord_commit()
    }

    fn ord_commit_pending(&self) -> bool {
        self.ord_input.is_none()
            && self.ord_commit.as_ref().is_some_and(|commit| {
                matches!(commit.outputs(), [placeholder] if placeholder.amount() == Amount::ZERO)
            })
    }

    fn try_build_ord_commit(&mut self) -> Result<(), ContractError> {
        let keys_known =
            self.ord_script_pk.is_some() && self.ord_int_pk.is_some() && self.market_script_pk.is_some();
        if keys_known && self.ord_commit_pending() {
            self.build_ord_commit()?;
        }
        Ok(())
    }

    /// Replaces the change placeholder with the 2-of-2 ordinal output plus real change, and
    /// derives the ordinal swap input from it.
    fn build_ord_commit(&mut self) -> Result<(), ContractError> {
        let network = self.builder.network();
        let (script, commitment) = self.ord_swap_commitment()?;
        let control_block = commitment
            .control_block(&script)
            .ok_or_else(|| ContractError::State("ord swap script is not committed".into()))?;

        let mut commit = required(&self.ord_commit, NAME_ORD_COMMIT)?.clone();
        let change_addr = commit
            .remove_last_output()
            .and_then(|placeholder| placeholder.address().cloned())
            .ok_or_else(|| ContractError::State(format!("{NAME_ORD_COMMIT} has no change address")))?;
        let ord_amount = commit
            .inputs()
            .first()
            .map(|input| input.utxo.amount())
            .ok_or_else(|| ContractError::State(format!("{NAME_ORD_COMMIT} has no ordinal input")))?;

        commit.add_output(Destination::from_address(ord_amount, commitment.address(network))?)?;
        commit.add_change_output(&change_addr.to_string())?;

        let witness = WitnessStack::from_items(vec![
            vec![0; 64],
            vec![0; 65],
            script.to_bytes(),
            control_block.serialize(),
        ]);
        let ord_input = TxInput::with_witness(commit.output_utxo(0)?, witness);
        debug!(txid = %ord_input.utxo.txid, amount = %ord_amount, "ordinal commit built");

        self.ord_input = Some(ord_input);
        self.ord_commit = Some(commit);
        Ok(())
    }

    /// Adds a buyer UTXO to the funds commit and re-solves its outputs.
    ///
    /// The commit pays `[brick1, brick2, main]` back to `addr`; the main output appears only
    /// once the inputs cover the swap.
    pub fn commit_funds(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let rate = self.builder.require_mining_fee_rate()?;
        let market_fee = self.market_fee_amount()?;
        let price = *required(&self.ord_price, NAME_ORD_PRICE)?;
        let network = self.builder.network();
        let dust = dust_limit();
        let swap_fee = self.calculate_swap_tx_fee(false)?;

        let mut funds = match &self.funds_commit {
            Some(funds) => funds.clone(),
            None => {
                let brick2 = if market_fee >= dust * 2 { market_fee - dust } else { dust };
                let mut funds = SimpleTransaction::with_config(self.builder.config());
                funds.set_mining_fee_rate(rate)?;
                funds.add_output(Destination::from_addr_str(dust, addr, network)?)?;
                funds.add_output(Destination::from_addr_str(brick2, addr, network)?)?;
                funds
            }
        };

        let name = format!("{NAME_FUNDS}[{}]", funds.inputs().len());
        funds.drop_change_output();
        let destination = Destination::from_addr_str(amount, addr, network)
            .map_err(|e| ContractError::TermWrongValue(name.clone()).caused_by(e))?;
        funds.add_input(Utxo::new(txid, nout, destination));

        let commit_fee = funds.calculate_whole_fee("change")?;
        let output_required = swap_fee + price + market_fee;
        let provided = funds.total_input();

        if provided >= output_required + commit_fee {
            let change = provided - output_required - commit_fee;
            let brick2 = if market_fee >= dust * 2 {
                market_fee - dust
            } else if change >= dust * 2 {
                change - dust
            } else {
                dust
            };
            funds.set_output_amount(1, brick2)?;
            funds
                .add_change_output(addr)
                .map_err(|e| ContractError::TermWrongValue(name).caused_by(e))?;
        } else {
            debug!(%provided, required = %(output_required + commit_fee), "funds do not cover the swap yet");
        }

        self.funds_commit = Some(funds);
        Ok(())
    }

    fn add_direct_input(&mut self, slot: usize, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        if self.funds_commit.is_some() {
            return Err(ContractError::State("swap is funded by the funds commit".into()));
        }
        if self.ord_input.is_none() {
            return Err(ContractError::State(format!("{NAME_ORD_COMMIT} is not built")));
        }
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(format!("{NAME_SWAP_INPUTS}[{slot}]")).caused_by(e))?;
        let input = TxInput::new(Utxo::new(txid, nout, destination));
        match slot {
            0 => reconcile_input(&mut self.brick1, input, "brick1"),
            1 => reconcile_input(&mut self.brick2, input, "brick2"),
            _ if self.main_inputs.iter().any(|input| !input.witness.is_empty()) => {
                Err(ContractError::State(format!("{NAME_SWAP_INPUTS} are already signed")))
            }
            _ => {
                self.main_inputs.push(input);
                Ok(())
            }
        }
    }

    /// Dust-sized UTXO becoming the first swap input.
    pub fn brick1_swap_utxo(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        self.add_direct_input(0, txid, nout, amount, addr)
    }

    /// Second swap input; together with brick 1 it pays the market fee or returns as change.
    pub fn brick2_swap_utxo(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        self.add_direct_input(1, txid, nout, amount, addr)
    }

    pub fn add_main_swap_utxo(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        self.add_direct_input(FUNDED_ORD_INDEX + 1, txid, nout, amount, addr)
    }

    fn has_direct_funding(&self) -> bool {
        self.brick1.is_some() && self.brick2.is_some() && !self.main_inputs.is_empty()
    }

    /// Swap inputs in transaction order.
    pub fn swap_inputs(&self) -> Result<Vec<TxInput>, ContractError> {
        let ord = self
            .ord_input
            .clone()
            .ok_or_else(|| ContractError::TermMissing(format!("{NAME_SWAP_INPUTS}[ord]")))?;
        match (&self.brick1, &self.brick2, self.main_inputs.is_empty()) {
            (None, None, true) => Ok(vec![ord]),
            (Some(brick1), Some(brick2), false) => {
                let mut inputs = vec![brick1.clone(), brick2.clone(), ord];
                inputs.extend(self.main_inputs.iter().cloned());
                Ok(inputs)
            }
            _ => Err(ContractError::State(format!("{NAME_SWAP_INPUTS} are inconsistent"))),
        }
    }

    fn swap_input_mut(&mut self, nin: usize, count: usize) -> Result<&mut TxInput, ContractError> {
        let input = match (count, nin) {
            (1, 0) | (_, FUNDED_ORD_INDEX) => self.ord_input.as_mut(),
            (_, 0) => self.brick1.as_mut(),
            (_, 1) => self.brick2.as_mut(),
            (_, n) => self.main_inputs.get_mut(n - FUNDED_ORD_INDEX - 1),
        };
        input.ok_or_else(|| ContractError::State(format!("no {NAME_SWAP_INPUTS}[{nin}]")))
    }

    pub fn make_swap_tx(&self) -> Result<Transaction, ContractError> {
        let inputs = self.swap_inputs()?;
        let price = *required(&self.ord_price, NAME_ORD_PRICE)?;
        let funds_payoff = required(&self.funds_payoff_addr, NAME_FUNDS_PAYOFF_ADDR)?;

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs.iter().map(TxInput::to_txin).collect::<Result<_, _>>()?,
            output: Vec::with_capacity(5),
        };

        if inputs.len() == 1 {
            tx.output.push(TxOut {
                value: price,
                script_pubkey: funds_payoff.script_pubkey(),
            });
            return Ok(tx);
        }

        let rate = self.builder.require_mining_fee_rate()?;
        let market_fee = self.builder.require_market_fee()?;
        let change_addr = self.builder.require_change_addr()?;
        let ord_payoff = required(&self.ord_payoff_addr, NAME_ORD_PAYOFF_ADDR)?;

        let bricks = inputs[0].utxo.amount() + inputs[1].utxo.amount();
        let market_takes_bricks = market_fee.amount() == bricks;
        tx.output.push(TxOut {
            value: bricks,
            script_pubkey: if market_takes_bricks {
                market_fee.required_tx_out()?.script_pubkey
            } else {
                change_addr.script_pubkey()
            },
        });
        tx.output.push(TxOut {
            value: inputs[FUNDED_ORD_INDEX].utxo.amount(),
            script_pubkey: ord_payoff.script_pubkey(),
        });
        tx.output.push(TxOut {
            value: price,
            script_pubkey: funds_payoff.script_pubkey(),
        });
        if !market_takes_bricks && market_fee.amount() > Amount::ZERO {
            tx.output.push(market_fee.required_tx_out()?);
        }

        let total_in: Amount = inputs.iter().map(|input| input.utxo.amount()).sum();
        let total_out: Amount = tx.output.iter().map(|out| out.value).sum();
        let spare = total_in.checked_sub(total_out + tx_fee(rate, tx.vsize()) + tx_fee(rate, TAPROOT_VOUT_VSIZE));
        if spare.is_some_and(|spare| spare >= dust_limit()) {
            tx.output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: change_addr.script_pubkey(),
            });
            let last = tx.output.len() - 1;
            tx.output[last].value = calculate_output_amount(total_in, rate, &tx, last)?;
        }
        Ok(tx)
    }

    /// Mining fee of the funded swap transaction.
    pub fn calculate_swap_tx_fee(&self, change: bool) -> Result<Amount, ContractError> {
        self.swap_tx_fee(change, false)
    }

    fn swap_tx_fee(&self, change: bool, extra_utxo: bool) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let market_fee = self.market_fee_amount()?;
        let dust = dust_limit();

        let mut vsize = TX_SWAP_BASE_VSIZE;
        if market_fee >= dust && market_fee < dust * 2 {
            vsize += TAPROOT_VOUT_VSIZE;
        }
        if !self.main_inputs.is_empty() {
            let inputs = FUNDED_ORD_INDEX + 1 + self.main_inputs.len();
            vsize += inputs.saturating_sub(4) * TAPROOT_KEYSPEND_VIN_VSIZE;
        }
        if extra_utxo {
            vsize += TAPROOT_KEYSPEND_VIN_VSIZE;
        }
        if change {
            vsize += TAPROOT_VOUT_VSIZE;
        }
        Ok(tx_fee(rate, vsize))
    }

    /// Mining fees of the funds commit and the swap together.
    pub fn calculate_whole_fee(&self, options: &str) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let market_fee = self.market_fee_amount()?;
        let opts: FeeOptions = options.parse()?;

        let commit_fee = match &self.funds_commit {
            Some(funds) if funds.has_change() => funds.calculate_whole_fee("")?,
            Some(funds) => funds.calculate_whole_fee("change")?,
            None => {
                let input_vsize = if opts.p2wpkh_utxo {
                    P2WPKH_VIN_VSIZE
                } else {
                    TAPROOT_KEYSPEND_VIN_VSIZE
                };
                tx_fee(rate, TX_BASE_VSIZE + TAPROOT_VOUT_VSIZE * 3 + input_vsize)
            }
        };
        let swap_fee = self.swap_tx_fee(market_fee >= dust_limit() * 2, opts.extra_utxo)?;
        Ok(swap_fee + commit_fee)
    }

    pub fn get_min_funding_amount(&self, options: &str) -> Result<Amount, ContractError> {
        let price = *required(&self.ord_price, NAME_ORD_PRICE)?;
        let market_fee = self.market_fee_amount()?;
        let mut amount = price + market_fee + self.calculate_whole_fee(options)?;
        if market_fee < dust_limit() * 2 {
            amount += dust_limit() * 2;
        }
        Ok(amount)
    }

    /// Minimum main input of a swap funded directly, bricks excluded.
    pub fn get_min_swap_funding_amount(&self) -> Result<Amount, ContractError> {
        let price = *required(&self.ord_price, NAME_ORD_PRICE)?;
        let market_fee = self.market_fee_amount()?;
        let mut amount = price + self.calculate_swap_tx_fee(false)?;
        if market_fee < dust_limit() * 2 {
            amount += market_fee;
        }
        Ok(amount)
    }

    pub fn get_new_output_mining_fee(&self) -> Result<Amount, ContractError> {
        Ok(self.builder.new_output_mining_fee())
    }

    fn funds_required(&self) -> Result<Amount, ContractError> {
        let price = *required(&self.ord_price, NAME_ORD_PRICE)?;
        Ok(self.calculate_whole_fee("")? + price + self.market_fee_amount()?)
    }

    pub fn sign_ord_commitment(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, TrustlessSwapPhase::OrdTerms)?;
        missing(&self.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
        missing(&self.ord_int_pk, NAME_ORD_INT_PK)?;
        if self.ord_input.is_none() {
            return Err(ContractError::State(format!("{NAME_ORD_COMMIT} is not built")));
        }
        self.ord_commit
            .as_mut()
            .ok_or_else(|| ContractError::TermMissing(NAME_ORD_COMMIT.into()))?
            .sign(registry, filter)
    }

    /// Seller signature of the ordinal input, committing to the price output only.
    pub fn sign_ord_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, TrustlessSwapPhase::OrdTerms)?;
        let (script, _) = self.ord_swap_commitment()?;
        let ord_pk = required(&self.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
        let key = registry.lookup(&ord_pk.to_string(), filter)?;

        let inputs = self.swap_inputs()?;
        let tx = self.make_swap_tx()?;
        let nin = ord_index(inputs.len());
        let sig = sign_taproot(
            key.keypair(),
            &tx,
            nin,
            &prevouts(&inputs)?,
            Some(&script),
            TapSighashType::SinglePlusAnyoneCanPay,
        )?;
        self.swap_input_mut(nin, inputs.len())?.witness.set(1, sig)?;
        info!(contract = Self::CONTRACT_TYPE, "ordinal swap signed by seller");
        Ok(())
    }

    /// Market signature of the ordinal input over the whole funded swap.
    pub fn sign_market_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        for phase in TrustlessSwapPhase::FundsSwapTerms.predecessors() {
            self.check_contract_terms(Self::PROTOCOL_VERSION, *phase)?;
        }

        let mut next = self.clone();
        if let Some(funds) = &self.funds_commit {
            if funds.outputs().len() < 3 {
                return Err(ContractError::State(format!("{NAME_FUNDS} commit has no main output")));
            }
            reconcile_input(&mut next.brick1, TxInput::new(funds.output_utxo(0)?), "brick1")?;
            reconcile_input(&mut next.brick2, TxInput::new(funds.output_utxo(1)?), "brick2")?;
            reconcile_inputs(&mut next.main_inputs, vec![TxInput::new(funds.output_utxo(2)?)], NAME_FUNDS)?;
        }

        let inputs = next.swap_inputs()?;
        if inputs.len() < 4 {
            return Err(ContractError::State(format!(
                "{NAME_SWAP_INPUTS} has inconsistent size: {}",
                inputs.len()
            )));
        }

        let (script, _) = next.ord_swap_commitment()?;
        let market_pk = required(&next.market_script_pk, NAME_MARKET_SCRIPT_PK)?;
        let key = registry.lookup(&market_pk.to_string(), filter)?;
        let tx = next.make_swap_tx()?;
        let sig = sign_taproot(
            key.keypair(),
            &tx,
            FUNDED_ORD_INDEX,
            &prevouts(&inputs)?,
            Some(&script),
            TapSighashType::Default,
        )?;
        next.swap_input_mut(FUNDED_ORD_INDEX, inputs.len())?.witness.set(0, sig)?;

        *self = next;
        info!(contract = Self::CONTRACT_TYPE, txid = %tx.compute_txid(), "ordinal swap signed by market");
        Ok(())
    }

    pub fn sign_funds_commitment(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, TrustlessSwapPhase::FundsTerms)?;
        let funds = self
            .funds_commit
            .as_ref()
            .ok_or_else(|| ContractError::State("funds are committed outside of the swap".into()))?;
        let required = self.funds_required()?;
        let provided = funds.total_input();
        if provided < required {
            return Err(ContractError::FundsNotEnough {
                context: NAME_FUNDS.into(),
                required: required.to_sat(),
                available: provided.to_sat(),
            });
        }
        if let Some(funds) = self.funds_commit.as_mut() {
            funds.sign(registry, filter)?;
        }
        Ok(())
    }

    /// Buyer signatures of every swap input except the ordinal.
    pub fn sign_funds_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, TrustlessSwapPhase::FundsSwapTerms)?;
        let inputs = self.swap_inputs()?;
        let tx = self.make_swap_tx()?;
        let prevouts = prevouts(&inputs)?;

        let mut witnesses = Vec::with_capacity(inputs.len() - 1);
        for (nin, input) in inputs.iter().enumerate() {
            if nin == FUNDED_ORD_INDEX {
                continue;
            }
            let witness = sign_destination(
                registry,
                filter,
                &input.utxo.destination,
                &tx,
                nin,
                &prevouts,
                TapSighashType::Default,
            )?;
            witnesses.push((nin, witness));
        }
        for (nin, witness) in witnesses {
            self.swap_input_mut(nin, inputs.len())?.witness.merge(&witness)?;
        }
        info!(contract = Self::CONTRACT_TYPE, "swap funds signed");
        Ok(())
    }

    /// Verifies every signature gathered for the swap so far.
    fn check_ord_swap_sig(&self) -> Result<(), ContractError> {
        let inputs = self.swap_inputs()?;
        let tx = self.make_swap_tx()?;
        let prevouts = prevouts(&inputs)?;
        let (script, _) = self.ord_swap_commitment()?;
        let market_pk = required(&self.market_script_pk, NAME_MARKET_SCRIPT_PK)?;
        let ord_pk = required(&self.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
        let ord_nin = ord_index(inputs.len());

        for (nin, input) in inputs.iter().enumerate() {
            let context = || ContractError::Signature(format!("{NAME_SWAP_INPUTS}[{nin}]"));
            if nin == ord_nin {
                for (slot, pk) in [(0, market_pk), (1, ord_pk)] {
                    if let Some(sig) = input.witness.get(slot).filter(|sig| !is_placeholder(sig)) {
                        verify_taproot_signature(pk, sig, &tx, nin, &prevouts, Some(&script))
                            .map_err(|e| context().caused_by(e))?;
                    }
                }
            } else if input.witness.get(0).is_some_and(|sig| !is_placeholder(sig)) {
                verify_input(&tx, nin, &prevouts).map_err(|e| context().caused_by(e))?;
            }
        }
        Ok(())
    }

    fn check_ord_price(&self) -> Result<(), ContractError> {
        let price = self
            .ord_price
            .ok_or_else(|| ContractError::TermMissing(NAME_ORD_PRICE.into()))?;
        if price < dust_limit() {
            return Err(ContractError::TermWrongValue(format!("{NAME_ORD_PRICE}: {price}")));
        }
        Ok(())
    }

    fn merge_swap_inputs(&mut self, reprs: Vec<UtxoRepr>) -> Result<(), ContractError> {
        if reprs.is_empty() {
            return Ok(());
        }
        let network = self.builder.network();
        let mut inputs = reprs
            .into_iter()
            .map(|repr| TxInput::from_repr(repr, network))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ContractError::TermWrongValue(NAME_SWAP_INPUTS.into()).caused_by(e))?;

        match inputs.len() {
            1 => reconcile_input(&mut self.ord_input, inputs.remove(0), "swap_inputs[ord]"),
            n if n > FUNDED_ORD_INDEX + 1 => {
                let main = inputs.split_off(FUNDED_ORD_INDEX + 1);
                let mut head = inputs.into_iter();
                if let (Some(brick1), Some(brick2), Some(ord)) = (head.next(), head.next(), head.next()) {
                    reconcile_input(&mut self.ord_input, ord, "swap_inputs[ord]")?;
                    reconcile_input(&mut self.brick1, brick1, "swap_inputs[0]")?;
                    reconcile_input(&mut self.brick2, brick2, "swap_inputs[1]")?;
                }
                reconcile_inputs(&mut self.main_inputs, main, NAME_SWAP_INPUTS)
            }
            n => Err(ContractError::TermWrongValue(format!("{NAME_SWAP_INPUTS} size: {n}"))),
        }
    }

    pub fn ord_commit_raw_transaction(&self) -> Result<String, ContractError> {
        Ok(serialize_hex(&required(&self.ord_commit, NAME_ORD_COMMIT)?.make_tx()?))
    }

    pub fn funds_commit_raw_transaction(&self) -> Result<String, ContractError> {
        let funds = self
            .funds_commit
            .as_ref()
            .ok_or_else(|| ContractError::State("funds are committed outside of the swap".into()))?;
        Ok(serialize_hex(&funds.make_tx()?))
    }

    pub fn ord_swap_raw_transaction(&self) -> Result<String, ContractError> {
        Ok(serialize_hex(&self.make_swap_tx()?))
    }

    pub fn transaction_count(&self, phase: TrustlessSwapPhase) -> usize {
        match phase {
            TrustlessSwapPhase::FundsTerms | TrustlessSwapPhase::FundsCommitSig => 1,
            _ => 2,
        }
    }

    pub fn raw_transaction(&self, phase: TrustlessSwapPhase, n: usize) -> Result<String, ContractError> {
        use TrustlessSwapPhase::*;
        match (phase, n) {
            (FundsTerms | FundsCommitSig, 0) => self.funds_commit_raw_transaction(),
            (OrdTerms | OrdSwapSig | FundsSwapTerms | FundsSwapSig, 0) => self.ord_commit_raw_transaction(),
            (OrdTerms | OrdSwapSig | FundsSwapTerms | FundsSwapSig, 1) => self.ord_swap_raw_transaction(),
            _ => Err(ContractError::State(format!(
                "{} has no transaction {n}",
                phase.as_str()
            ))),
        }
    }
}

impl PhasedContract for TrustlessSwapBuilder {
    type Phase = TrustlessSwapPhase;
    type Params = TrustlessSwapParams;

    const CONTRACT_TYPE: &'static str = "TrustlessSwapInscription";
    const PROTOCOL_VERSION: u32 = 6;
    const SUPPORTED_VERSIONS: &'static [u32] = &[6];

    fn make_params(&self, _version: u32, phase: TrustlessSwapPhase) -> Result<TrustlessSwapParams, ContractError> {
        use TrustlessSwapPhase::*;
        let ord_terms = phase.reaches(OrdTerms);
        let ord_sig = phase.reaches(OrdSwapSig);
        let funds_terms = phase.reaches(FundsTerms);
        let funds_sig = phase.reaches(FundsCommitSig);

        let tx_phase = |signed| if signed { TxPhase::TxSignature } else { TxPhase::TxTerms };
        let swap_inputs = if ord_sig {
            self.swap_inputs()?
                .iter()
                .map(|input| input.to_repr(true))
                .collect()
        } else {
            Vec::new()
        };

        Ok(TrustlessSwapParams {
            common: self.builder.make_params(true, funds_terms, funds_terms),
            ord_price: self.ord_price,
            market_script_pk: self.market_script_pk.filter(|_| ord_terms),
            ord_script_pk: self.ord_script_pk.filter(|_| ord_sig),
            ord_int_pk: self.ord_int_pk.filter(|_| ord_sig),
            funds_payoff_addr: self
                .funds_payoff_addr
                .as_ref()
                .filter(|_| ord_terms)
                .map(Address::to_string),
            ord_payoff_addr: self
                .ord_payoff_addr
                .as_ref()
                .filter(|_| funds_terms)
                .map(Address::to_string),
            ord_commit: self
                .ord_commit
                .as_ref()
                .filter(|_| ord_terms)
                .map(|commit| commit.tx_params(tx_phase(ord_sig))),
            funds: self
                .funds_commit
                .as_ref()
                .filter(|_| funds_terms)
                .map(|funds| funds.tx_params(tx_phase(funds_sig))),
            swap_inputs,
        })
    }

    fn merge_params(
        &mut self,
        params: TrustlessSwapParams,
        _version: u32,
        _phase: TrustlessSwapPhase,
    ) -> Result<(), ContractError> {
        let network = self.builder.network();
        let config = self.builder.config().clone();
        self.builder.merge_params(params.common)?;
        reconcile(&mut self.ord_price, params.ord_price, NAME_ORD_PRICE)?;
        reconcile(&mut self.market_script_pk, params.market_script_pk, NAME_MARKET_SCRIPT_PK)?;
        reconcile(&mut self.ord_script_pk, params.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
        reconcile(&mut self.ord_int_pk, params.ord_int_pk, NAME_ORD_INT_PK)?;

        let funds_payoff = params
            .funds_payoff_addr
            .map(|addr| parse_address(&addr, network))
            .transpose()?;
        reconcile(&mut self.funds_payoff_addr, funds_payoff, NAME_FUNDS_PAYOFF_ADDR)?;
        let ord_payoff = params
            .ord_payoff_addr
            .map(|addr| parse_address(&addr, network))
            .transpose()?;
        reconcile(&mut self.ord_payoff_addr, ord_payoff, NAME_ORD_PAYOFF_ADDR)?;

        if let Some(commit) = params.ord_commit {
            // A commit still holding the change placeholder is completed from the seller keys
            // first, so it compares equal to the seller's own.
            self.try_build_ord_commit()?;
            self.ord_commit
                .get_or_insert_with(|| SimpleTransaction::with_config(&config))
                .merge_tx_params(commit)?;
        }
        self.try_build_ord_commit()?;

        if let Some(funds) = params.funds {
            self.funds_commit
                .get_or_insert_with(|| SimpleTransaction::with_config(&config))
                .merge_tx_params(funds)?;
        }
        self.merge_swap_inputs(params.swap_inputs)
    }

    fn check_phase_terms(&self, _version: u32, phase: TrustlessSwapPhase) -> Result<(), ContractError> {
        match phase {
            TrustlessSwapPhase::OrdTerms => {
                self.check_ord_price()?;
                missing(&self.builder.mining_fee_rate(), NAME_MINING_FEE_RATE)?;
                missing(&self.market_script_pk, NAME_MARKET_SCRIPT_PK)?;
                let commit = self
                    .ord_commit
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_ORD_COMMIT.into()))?;
                if commit.inputs().is_empty() {
                    return Err(ContractError::TermMissing(format!("{NAME_ORD_COMMIT}[ord]")));
                }
                missing(&self.funds_payoff_addr, NAME_FUNDS_PAYOFF_ADDR)
            }
            TrustlessSwapPhase::OrdSwapSig => {
                let ord = self
                    .ord_input
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(format!("{NAME_SWAP_INPUTS}[ord]")))?;
                self.swap_inputs()?;
                if ord.utxo.amount() < dust_limit() {
                    return Err(ContractError::TermWrongValue(format!(
                        "{NAME_SWAP_INPUTS}[ord].amount: {}",
                        ord.utxo.amount()
                    )));
                }
                if ord.witness.get(1).map_or(true, is_placeholder) {
                    return Err(ContractError::TermMissing(format!("{NAME_SWAP_INPUTS}[ord].witness")));
                }
                missing(&self.ord_script_pk, NAME_ORD_SCRIPT_PK)?;
                missing(&self.ord_int_pk, NAME_ORD_INT_PK)?;
                required(&self.ord_commit, NAME_ORD_COMMIT)?
                    .check_terms(TxPhase::TxSignature)
                    .map_err(|e| ContractError::TermMissing(NAME_ORD_COMMIT.into()).caused_by(e))
            }
            TrustlessSwapPhase::FundsTerms => {
                self.check_ord_price()?;
                missing(&self.builder.market_fee(), NAME_MARKET_FEE)?;
                missing(&self.builder.mining_fee_rate(), NAME_MINING_FEE_RATE)?;
                missing(&self.builder.change_addr(), NAME_CHANGE_ADDR)?;
                missing(&self.ord_payoff_addr, NAME_ORD_PAYOFF_ADDR)?;
                match &self.funds_commit {
                    Some(funds) => {
                        funds.check_terms(TxPhase::TxTerms)?;
                        let required = self.funds_required()?;
                        let provided = funds.total_input();
                        if provided < required {
                            return Err(ContractError::FundsNotEnough {
                                context: NAME_FUNDS.into(),
                                required: required.to_sat(),
                                available: provided.to_sat(),
                            });
                        }
                        Ok(())
                    }
                    None if self.has_direct_funding() => Ok(()),
                    None => Err(ContractError::TermMissing(NAME_FUNDS.into())),
                }
            }
            TrustlessSwapPhase::FundsCommitSig => match &self.funds_commit {
                Some(funds) => funds
                    .check_terms(TxPhase::TxSignature)
                    .map_err(|e| ContractError::TermMissing(NAME_FUNDS.into()).caused_by(e)),
                None if self.has_direct_funding() => Ok(()),
                None => Err(ContractError::TermMissing(NAME_FUNDS.into())),
            },
            TrustlessSwapPhase::FundsSwapTerms => {
                let inputs = self.swap_inputs()?;
                if inputs.len() < 4 {
                    return Err(ContractError::TermMissing(format!(
                        "{NAME_SWAP_INPUTS} size: {}",
                        inputs.len()
                    )));
                }
                if inputs[FUNDED_ORD_INDEX].witness.get(0).map_or(true, is_placeholder) {
                    return Err(ContractError::TermMissing(format!(
                        "{NAME_SWAP_INPUTS}[ord].witness[0]"
                    )));
                }
                Ok(())
            }
            TrustlessSwapPhase::FundsSwapSig => {
                for (nin, input) in self.swap_inputs()?.iter().enumerate() {
                    if !input.witness.is_complete() {
                        return Err(ContractError::TermMissing(format!(
                            "{NAME_SWAP_INPUTS}[{nin}].witness"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    fn check_phase_signatures(&self, phase: TrustlessSwapPhase) -> Result<(), ContractError> {
        match phase {
            TrustlessSwapPhase::OrdSwapSig => {
                required(&self.ord_commit, NAME_ORD_COMMIT)?.check_sig()?;
                self.check_ord_swap_sig()
            }
            TrustlessSwapPhase::FundsCommitSig => match &self.funds_commit {
                Some(funds) => funds.check_sig(),
                None => Ok(()),
            },
            TrustlessSwapPhase::FundsSwapTerms | TrustlessSwapPhase::FundsSwapSig => self.check_ord_swap_sig(),
            TrustlessSwapPhase::OrdTerms | TrustlessSwapPhase::FundsTerms => Ok(()),
        }
    }
}
