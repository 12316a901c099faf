//! Ordinal swap with the buyer funds held in escrow.
//!
//! The buyer commits the price to a taproot output with an unspendable internal key and two
//! leaves: `buyer ∧ market` to settle the swap and a 12 block timelocked refund to the buyer.
//! The seller signs the ordinal input with `SIGHASH_ALL|ANYONECANPAY` against a swap paying
//! the ordinal to the market key, and the market forwards it to the buyer with a payoff
//! transaction once the swap settles.

use bitcoin::{
    absolute::LockTime,
    consensus::encode::serialize_hex,
    key::TweakedPublicKey,
    secp256k1::{SecretKey, XOnlyPublicKey},
    transaction::Version,
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn, TxOut,
    Witness,
};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use tracing::*;
use utxord_btc_types::{
    fee::{calculate_output_amount, tx_fee, FeeOptions, MIN_TAPROOT_TX_VSIZE},
    parse_address, sign_destination, sign_taproot, verify_input, verify_taproot_signature,
    ContractError, Destination, KeyRegistry, TxInput, Utxo, UtxoRepr, WitnessStack,
};
use utxord_config::Config;
use utxord_taproot::{csv_timelock, multisig_2of2, nums_point, random_unspendable_key, unspendable_key, TaprootCommitment};

use crate::{
    builder::{check_p2address, CommonParams, ContractBuilder, NAME_MARKET_FEE, NAME_MINING_FEE_RATE},
    reconcile, reconcile_input, reconcile_inputs, ContractPhase, PhasedContract,
};

pub const NAME_ORD_PRICE: &str = "ord_price";
pub const NAME_ORD_MINING_FEE_RATE: &str = "ord_mining_fee_rate";
pub const NAME_SWAP_SCRIPT_PK_B: &str = "swap_script_pk_B";
pub const NAME_SWAP_SCRIPT_PK_M: &str = "swap_script_pk_M";
pub const NAME_ORD_UTXO: &str = "ord_utxo";
pub const NAME_ORD_PAYOFF_ADDR: &str = "ord_payoff_addr";
pub const NAME_FUNDS_PAYOFF_ADDR: &str = "funds_payoff_addr";
pub const NAME_FUNDS: &str = "funds";
pub const NAME_FUNDS_UNSPENDABLE_KEY: &str = "funds_unspendable_key_factor";
pub const NAME_ORD_PAYOFF_SIG: &str = "ordpayoff_sig";
pub const NAME_FUNDS_SWAP_SIG_B: &str = "funds_swap_sig_B";
pub const NAME_FUNDS_SWAP_SIG_M: &str = "funds_swap_sig_M";

/// Blocks after which the buyer may take the escrowed funds back.
pub const COMMIT_TIMEOUT: u16 = 12;

/// Last version that rejects legacy address destinations.
const LAST_NO_P2ADDRESS_VERSION: u32 = 5;

/// Index of the escrow input in the swap transaction.
const ESCROW_NIN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    OrdTerms,
    OrdSwapSig,
    FundsTerms,
    FundsCommitSig,
    MarketPayoffTerms,
    MarketPayoffSig,
    FundsSwapSig,
    MarketSwapSig,
}

impl ContractPhase for SwapPhase {
    const ALL: &'static [Self] = &[
        SwapPhase::OrdTerms,
        SwapPhase::OrdSwapSig,
        SwapPhase::FundsTerms,
        SwapPhase::FundsCommitSig,
        SwapPhase::MarketPayoffTerms,
        SwapPhase::MarketPayoffSig,
        SwapPhase::FundsSwapSig,
        SwapPhase::MarketSwapSig,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            SwapPhase::OrdTerms => "ORD_TERMS",
            SwapPhase::OrdSwapSig => "ORD_SWAP_SIG",
            SwapPhase::FundsTerms => "FUNDS_TERMS",
            SwapPhase::FundsCommitSig => "FUNDS_COMMIT_SIG",
            SwapPhase::MarketPayoffTerms => "MARKET_PAYOFF_TERMS",
            SwapPhase::MarketPayoffSig => "MARKET_PAYOFF_SIG",
            SwapPhase::FundsSwapSig => "FUNDS_SWAP_SIG",
            SwapPhase::MarketSwapSig => "MARKET_SWAP_SIG",
        }
    }

    fn predecessors(self) -> &'static [Self] {
        use SwapPhase::*;
        match self {
            OrdTerms | FundsTerms => &[],
            OrdSwapSig => &[OrdTerms],
            FundsCommitSig => &[FundsTerms],
            MarketPayoffTerms => &[OrdSwapSig, FundsCommitSig],
            MarketPayoffSig => &[MarketPayoffTerms],
            FundsSwapSig => &[MarketPayoffSig],
            MarketSwapSig => &[FundsSwapSig],
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapParams {
    #[serde(flatten)]
    pub common: CommonParams,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bitcoin::amount::serde::as_sat::opt"
    )]
    pub ord_price: Option<Amount>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bitcoin::amount::serde::as_sat::opt"
    )]
    pub ord_mining_fee_rate: Option<Amount>,
    #[serde(rename = "swap_script_pk_M", default, skip_serializing_if = "Option::is_none")]
    pub swap_script_pk_m: Option<XOnlyPublicKey>,
    #[serde(rename = "swap_script_pk_B", default, skip_serializing_if = "Option::is_none")]
    pub swap_script_pk_b: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_utxo: Option<UtxoRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funds_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub funds: Vec<UtxoRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funds_unspendable_key_factor: Option<SecretKey>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordpayoff_sig: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(rename = "funds_swap_sig_B", default, skip_serializing_if = "Option::is_none")]
    pub funds_swap_sig_b: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(rename = "funds_swap_sig_M", default, skip_serializing_if = "Option::is_none")]
    pub funds_swap_sig_m: Option<Vec<u8>>,
}

/// Leaves and commitment of the escrow output.
#[derive(Debug, Clone)]
struct Escrow {
    swap_script: ScriptBuf,
    refund_script: ScriptBuf,
    commitment: TaprootCommitment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapInscriptionBuilder {
    builder: ContractBuilder,
    ord_price: Option<Amount>,
    ord_mining_fee_rate: Option<Amount>,
    swap_script_pk_m: Option<XOnlyPublicKey>,
    swap_script_pk_b: Option<XOnlyPublicKey>,
    ord_input: Option<TxInput>,
    funds_payoff_addr: Option<Address>,
    ord_payoff_addr: Option<Address>,
    funds: Vec<TxInput>,
    funds_unspendable_key_factor: Option<SecretKey>,
    ord_payoff_sig: Option<Vec<u8>>,
    funds_swap_sig_b: Option<Vec<u8>>,
    funds_swap_sig_m: Option<Vec<u8>>,
    funds_payback: Option<Transaction>,
}

fn key_error(context: &str) -> impl FnOnce(bitcoin::secp256k1::Error) -> ContractError + '_ {
    move |e| ContractError::Key(format!("{context}: {e}"))
}

fn missing<T>(value: &Option<T>, name: &str) -> Result<(), ContractError> {
    match value {
        Some(_) => Ok(()),
        None => Err(ContractError::TermMissing(name.to_owned())),
    }
}

fn state<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T, ContractError> {
    value
        .as_ref()
        .ok_or_else(|| ContractError::State(format!("{name} not defined")))
}

/// Stand-in taproot output script with the size of any real one.
fn taproot_stub() -> Result<ScriptBuf, ContractError> {
    let key = nums_point().map_err(key_error("nums point"))?;
    Ok(ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(key)))
}

/// Schnorr signature with the default sighash type.
fn placeholder_schnorr_sig() -> Vec<u8> {
    vec![0; 64]
}

/// Schnorr signature carrying an explicit sighash byte, as the seller's `ALL|ANYONECANPAY` one.
fn placeholder_acp_sig() -> Vec<u8> {
    vec![0; 65]
}

impl SwapInscriptionBuilder {
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
            ord_mining_fee_rate: None,
            swap_script_pk_m: None,
            swap_script_pk_b: None,
            ord_input: None,
            funds_payoff_addr: None,
            ord_payoff_addr: None,
            funds: Vec::new(),
            funds_unspendable_key_factor: None,
            ord_payoff_sig: None,
            funds_swap_sig_b: None,
            funds_swap_sig_m: None,
            funds_payback: None,
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

    /// Fee rate of the payoff transaction forwarding the ordinal to the buyer.
    pub fn set_ord_mining_fee_rate(&mut self, rate: Amount) -> Result<(), ContractError> {
        reconcile(&mut self.ord_mining_fee_rate, Some(rate), NAME_ORD_MINING_FEE_RATE)
    }

    pub fn set_swap_script_pk_m(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.swap_script_pk_m, Some(pk), NAME_SWAP_SCRIPT_PK_M)
    }

    pub fn set_swap_script_pk_b(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.swap_script_pk_b, Some(pk), NAME_SWAP_SCRIPT_PK_B)
    }

    /// Fixes the factor of the escrow internal key instead of drawing a random one at signing.
    pub fn set_funds_unspendable_key_factor(&mut self, factor: SecretKey) -> Result<(), ContractError> {
        reconcile(&mut self.funds_unspendable_key_factor, Some(factor), NAME_FUNDS_UNSPENDABLE_KEY)
    }

    pub fn set_funds_payoff_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        let addr = parse_address(addr, self.builder.network())?;
        reconcile(&mut self.funds_payoff_addr, Some(addr), NAME_FUNDS_PAYOFF_ADDR)
    }

    pub fn set_ord_payoff_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        let addr = parse_address(addr, self.builder.network())?;
        reconcile(&mut self.ord_payoff_addr, Some(addr), NAME_ORD_PAYOFF_ADDR)
    }

    pub fn ord_utxo(&mut self, txid: bitcoin::Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(NAME_ORD_UTXO.into()).caused_by(e))?;
        reconcile_input(&mut self.ord_input, TxInput::new(Utxo::new(txid, nout, destination)), NAME_ORD_UTXO)
    }

    pub fn add_funds_utxo(
        &mut self,
        txid: bitcoin::Txid,
        nout: u32,
        amount: Amount,
        addr: &str,
    ) -> Result<(), ContractError> {
        if self.funds.iter().any(|input| !input.witness.is_empty()) {
            return Err(ContractError::State(format!("{NAME_FUNDS} are already signed")));
        }
        let name = format!("{NAME_FUNDS}[{}]", self.funds.len());
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(name).caused_by(e))?;
        self.funds.push(TxInput::new(Utxo::new(txid, nout, destination)));
        Ok(())
    }

    fn market_fee_amount(&self) -> Result<Amount, ContractError> {
        Ok(self.builder.require_market_fee()?.amount())
    }

    /// Fee the ordinal output carries for the payoff transaction.
    fn ord_payoff_fee(&self) -> Result<Amount, ContractError> {
        let rate = *state(&self.ord_mining_fee_rate, NAME_ORD_MINING_FEE_RATE)?;
        Ok(tx_fee(rate, MIN_TAPROOT_TX_VSIZE))
    }

    fn escrow(&self) -> Result<Escrow, ContractError> {
        let pk_b = state(&self.swap_script_pk_b, NAME_SWAP_SCRIPT_PK_B)?;
        let pk_m = state(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
        let factor = state(&self.funds_unspendable_key_factor, NAME_FUNDS_UNSPENDABLE_KEY)?;
        let internal_key = unspendable_key(factor).map_err(key_error(NAME_FUNDS_UNSPENDABLE_KEY))?;
        Ok(Self::make_escrow(internal_key, pk_b, pk_m))
    }

    /// Escrow of the right shape for fee estimation, built from stub keys only.
    fn escrow_template() -> Result<Escrow, ContractError> {
        let stub = nums_point().map_err(key_error("nums point"))?;
        Ok(Self::make_escrow(stub, &stub, &stub))
    }

    fn make_escrow(internal_key: XOnlyPublicKey, pk_b: &XOnlyPublicKey, pk_m: &XOnlyPublicKey) -> Escrow {
        let swap_script = multisig_2of2(pk_b, pk_m);
        let refund_script = csv_timelock(COMMIT_TIMEOUT, pk_b);
        let commitment = TaprootCommitment::new(internal_key, [swap_script.clone(), refund_script.clone()]);
        Escrow {
            swap_script,
            refund_script,
            commitment,
        }
    }

    fn escrow_witness(escrow: &Escrow, sig_m: Option<&[u8]>, sig_b: Option<&[u8]>) -> Result<Witness, ContractError> {
        let control_block = escrow
            .commitment
            .control_block(&escrow.swap_script)
            .ok_or_else(|| ContractError::State("escrow swap script is not committed".into()))?;
        let stack = WitnessStack::from_items(vec![
            sig_m.map_or_else(placeholder_schnorr_sig, <[u8]>::to_vec),
            sig_b.map_or_else(placeholder_schnorr_sig, <[u8]>::to_vec),
            escrow.swap_script.to_bytes(),
            control_block.serialize(),
        ]);
        Ok(stack.to_witness())
    }

    fn swap_outputs(&self, ord_amount: Amount, funds_payoff: ScriptBuf) -> Result<Vec<TxOut>, ContractError> {
        let price = *state(&self.ord_price, NAME_ORD_PRICE)?;
        let pk_m = state(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
        let market_fee = self.builder.require_market_fee()?;

        let mut outputs = vec![
            TxOut {
                value: ord_amount + self.ord_payoff_fee()?,
                script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(*pk_m)),
            },
            TxOut {
                value: price,
                script_pubkey: funds_payoff,
            },
        ];
        if market_fee.amount() > Amount::ZERO {
            outputs.push(market_fee.required_tx_out()?);
        }
        Ok(outputs)
    }

    /// Swap transaction of final size.
    ///
    /// The shape is fixed: a taproot ordinal input signed `ALL|ANYONECANPAY`, a taproot funds
    /// payoff and a stub escrow. It does not depend on the seller's terms.
    fn swap_tx_template(&self) -> Result<Transaction, ContractError> {
        let ord_in = TxIn {
            witness: Witness::from_slice(&[placeholder_acp_sig()]),
            ..TxIn::default()
        };
        let escrow_in = TxIn {
            witness: Self::escrow_witness(&Self::escrow_template()?, None, None)?,
            ..TxIn::default()
        };
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![ord_in, escrow_in],
            output: self.swap_outputs(Amount::ZERO, taproot_stub()?)?,
        })
    }

    fn swap_fee(&self) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        Ok(tx_fee(rate, self.swap_tx_template()?.vsize()))
    }

    /// Amount the escrow output has to carry for the swap to pay price, fees and the
    /// ordinal payoff.
    pub fn escrow_amount(&self) -> Result<Amount, ContractError> {
        let price = *state(&self.ord_price, NAME_ORD_PRICE)?;
        Ok(price + self.market_fee_amount()? + self.ord_payoff_fee()? + self.swap_fee()?)
    }

    fn funds_commit_template(&self, opts: FeeOptions) -> Result<Transaction, ContractError> {
        let input = if self.funds.is_empty() {
            let witness = if opts.p2wpkh_utxo {
                Witness::from_slice(&[vec![0; 71], vec![0; 33]])
            } else {
                Witness::from_slice(&[placeholder_schnorr_sig()])
            };
            vec![TxIn {
                witness,
                ..TxIn::default()
            }]
        } else {
            self.funds.iter().map(TxInput::to_txin).collect::<Result<_, _>>()?
        };

        let mut output = vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: taproot_stub()?,
        }];
        if opts.change {
            let script_pubkey = match self.builder.change_addr() {
                Some(addr) => addr.script_pubkey(),
                None => taproot_stub()?,
            };
            output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey,
            });
        }
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        })
    }

    /// Mining fees of the funds commit, the swap and the ordinal payoff.
    ///
    /// Options: `change`, `p2wpkh_utxo`.
    pub fn calculate_whole_fee(&self, options: &str) -> Result<Amount, ContractError> {
        let opts: FeeOptions = options.parse()?;
        let rate = self.builder.quote_mining_fee_rate();
        let commit_fee = tx_fee(rate, self.funds_commit_template(opts)?.vsize());
        Ok(commit_fee + self.swap_fee()? + self.ord_payoff_fee()?)
    }

    pub fn get_min_funding_amount(&self, options: &str) -> Result<Amount, ContractError> {
        let price = *state(&self.ord_price, NAME_ORD_PRICE)?;
        Ok(price + self.market_fee_amount()? + self.calculate_whole_fee(options)?)
    }

    pub fn get_new_input_mining_fee(&self) -> Result<Amount, ContractError> {
        Ok(self.builder.new_input_mining_fee())
    }

    pub fn get_new_output_mining_fee(&self) -> Result<Amount, ContractError> {
        Ok(self.builder.new_output_mining_fee())
    }

    /// Funds commit: `[escrow, change?]`.
    ///
    /// With change the escrow carries exactly what the swap needs; without it the escrow takes
    /// everything the inputs leave after the commit fee.
    pub fn make_funds_commit_tx(&self) -> Result<Transaction, ContractError> {
        let rate = self.builder.require_mining_fee_rate()?;
        if self.funds.is_empty() {
            return Err(ContractError::TermMissing(NAME_FUNDS.into()));
        }
        let escrow = self.escrow()?;
        let required = self.escrow_amount()?;
        let provided: Amount = self.funds.iter().map(|input| input.utxo.amount()).sum();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.funds.iter().map(TxInput::to_txin).collect::<Result<_, _>>()?,
            output: vec![TxOut {
                value: required,
                script_pubkey: escrow.commitment.script_pubkey(),
            }],
        };

        if let Some(change_addr) = self.builder.change_addr() {
            tx.output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: change_addr.script_pubkey(),
            });
            let change = calculate_output_amount(provided, rate, &tx, 1)
                .ok()
                .map(|amount| Destination::from_address(amount, change_addr.clone()))
                .transpose()?;
            match change {
                Some(change) if !self.builder.is_dust(&change) => {
                    tx.output[1].value = change.amount();
                    return Ok(tx);
                }
                _ => {
                    tx.output.pop();
                }
            }
        }

        let committed = calculate_output_amount(provided, rate, &tx, 0)?;
        if committed < required {
            return Err(ContractError::FundsNotEnough {
                context: NAME_FUNDS.into(),
                required: required.to_sat(),
                available: committed.to_sat(),
            });
        }
        tx.output[0].value = committed;
        Ok(tx)
    }

    fn escrow_txin(&self, funds_commit: &Transaction) -> Result<TxIn, ContractError> {
        Ok(TxIn {
            previous_output: OutPoint::new(funds_commit.compute_txid(), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Self::escrow_witness(
                &self.escrow()?,
                self.funds_swap_sig_m.as_deref(),
                self.funds_swap_sig_b.as_deref(),
            )?,
        })
    }

    /// Swap transaction; the seller view leaves the escrow input out.
    pub fn make_swap_tx(&self, with_funds: bool) -> Result<Transaction, ContractError> {
        let ord = state(&self.ord_input, NAME_ORD_UTXO)?;
        let funds_payoff = state(&self.funds_payoff_addr, NAME_FUNDS_PAYOFF_ADDR)?;

        let mut input = vec![ord.to_txin()?];
        if with_funds {
            input.push(self.escrow_txin(&self.make_funds_commit_tx()?)?);
        }
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output: self.swap_outputs(ord.utxo.amount(), funds_payoff.script_pubkey())?,
        })
    }

    fn swap_prevouts(&self, with_funds: bool) -> Result<Vec<TxOut>, ContractError> {
        let mut prevouts = vec![state(&self.ord_input, NAME_ORD_UTXO)?.utxo.tx_out()?];
        if with_funds {
            let funds_commit = self.make_funds_commit_tx()?;
            prevouts.push(funds_commit.output[0].clone());
        }
        Ok(prevouts)
    }

    /// Market transaction forwarding the ordinal from the swap to the buyer.
    pub fn make_payoff_tx(&self) -> Result<Transaction, ContractError> {
        let ord = state(&self.ord_input, NAME_ORD_UTXO)?;
        let ord_payoff = state(&self.ord_payoff_addr, NAME_ORD_PAYOFF_ADDR)?;
        let swap = self.make_swap_tx(true)?;
        let sig = self.ord_payoff_sig.clone().unwrap_or_else(placeholder_schnorr_sig);

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(swap.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::from_slice(&[sig]),
            }],
            output: vec![TxOut {
                value: ord.utxo.amount(),
                script_pubkey: ord_payoff.script_pubkey(),
            }],
        })
    }

    pub fn sign_ord_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::OrdTerms)?;
        let tx = self.make_swap_tx(false)?;
        let prevouts = self.swap_prevouts(false)?;
        let ord = state(&self.ord_input, NAME_ORD_UTXO)?;
        let witness = sign_destination(
            registry,
            filter,
            &ord.utxo.destination,
            &tx,
            0,
            &prevouts,
            TapSighashType::AllPlusAnyoneCanPay,
        )?;
        if let Some(ord) = self.ord_input.as_mut() {
            ord.witness.merge(&witness)?;
        }
        info!(contract = Self::CONTRACT_TYPE, "ordinal swap signed by seller");
        Ok(())
    }

    /// Signs the funds commit, fixing the escrow internal key first.
    pub fn sign_funds_commitment(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::FundsTerms)?;
        let mut next = self.clone();
        if next.funds_unspendable_key_factor.is_none() {
            let (_, factor) = random_unspendable_key().map_err(key_error(NAME_FUNDS_UNSPENDABLE_KEY))?;
            next.funds_unspendable_key_factor = Some(factor);
        }

        let tx = next.make_funds_commit_tx()?;
        let prevouts = next
            .funds
            .iter()
            .map(|input| input.utxo.tx_out())
            .collect::<Result<Vec<_>, _>>()?;
        for nin in 0..next.funds.len() {
            let witness = sign_destination(
                registry,
                filter,
                &next.funds[nin].utxo.destination,
                &tx,
                nin,
                &prevouts,
                TapSighashType::Default,
            )?;
            next.funds[nin].witness.merge(&witness)?;
        }

        *self = next;
        info!(contract = Self::CONTRACT_TYPE, txid = %tx.compute_txid(), "funds commit signed");
        Ok(())
    }

    pub fn market_sign_ord_payoff_tx(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::MarketPayoffTerms)?;
        let pk_m = state(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
        let key = registry.lookup(&pk_m.to_string(), filter)?;

        let swap = self.make_swap_tx(true)?;
        let payoff = self.make_payoff_tx()?;
        let sig = sign_taproot(key.keypair(), &payoff, 0, &swap.output[..1], None, TapSighashType::Default)?;
        self.ord_payoff_sig = Some(sig);
        info!(contract = Self::CONTRACT_TYPE, "ordinal payoff signed by market");
        Ok(())
    }

    pub fn sign_funds_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::MarketPayoffSig)?;
        let sig = self.sign_escrow(registry, filter, state(&self.swap_script_pk_b, NAME_SWAP_SCRIPT_PK_B)?)?;
        self.funds_swap_sig_b = Some(sig);
        info!(contract = Self::CONTRACT_TYPE, "swap signed by buyer");
        Ok(())
    }

    /// Completes the swap and checks both of its inputs against the outputs they spend.
    pub fn market_sign_swap(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::FundsSwapSig)?;
        let sig = self.sign_escrow(registry, filter, state(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?)?;

        let mut next = self.clone();
        next.funds_swap_sig_m = Some(sig);
        let tx = next.make_swap_tx(true)?;
        let prevouts = next.swap_prevouts(true)?;
        for nin in 0..tx.input.len() {
            verify_input(&tx, nin, &prevouts)
                .map_err(|e| ContractError::Signature(format!("swap input {nin}")).caused_by(e))?;
        }

        *self = next;
        info!(contract = Self::CONTRACT_TYPE, txid = %tx.compute_txid(), "swap signed by market");
        Ok(())
    }

    fn sign_escrow(&self, registry: &dyn KeyRegistry, filter: &str, pk: &XOnlyPublicKey) -> Result<Vec<u8>, ContractError> {
        let key = registry.lookup(&pk.to_string(), filter)?;
        let escrow = self.escrow()?;
        let tx = self.make_swap_tx(true)?;
        sign_taproot(
            key.keypair(),
            &tx,
            ESCROW_NIN,
            &self.swap_prevouts(true)?,
            Some(&escrow.swap_script),
            TapSighashType::Default,
        )
    }

    /// Buyer refund through the timelocked leaf, spendable `COMMIT_TIMEOUT` blocks after the
    /// funds commit confirms.
    pub fn sign_funds_pay_back(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        self.check_contract_terms(Self::PROTOCOL_VERSION, SwapPhase::FundsCommitSig)?;
        let rate = self.builder.require_mining_fee_rate()?;
        let pk_b = state(&self.swap_script_pk_b, NAME_SWAP_SCRIPT_PK_B)?;
        let key = registry.lookup(&pk_b.to_string(), filter)?;

        let escrow = self.escrow()?;
        let funds_commit = self.make_funds_commit_tx()?;
        let escrow_out = funds_commit.output[0].clone();
        let control_block = escrow
            .commitment
            .control_block(&escrow.refund_script)
            .ok_or_else(|| ContractError::State("escrow refund script is not committed".into()))?;

        let mut payback = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(funds_commit.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::from_height(COMMIT_TIMEOUT),
                witness: Witness::from_slice(&[
                    placeholder_schnorr_sig(),
                    escrow.refund_script.to_bytes(),
                    control_block.serialize(),
                ]),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(*pk_b)),
            }],
        };
        payback.output[0].value = calculate_output_amount(escrow_out.value, rate, &payback, 0)?;

        let sig = sign_taproot(
            key.keypair(),
            &payback,
            0,
            &[escrow_out],
            Some(&escrow.refund_script),
            TapSighashType::Default,
        )?;
        payback.input[0].witness = Witness::from_slice(&[
            sig,
            escrow.refund_script.to_bytes(),
            control_block.serialize(),
        ]);

        self.funds_payback = Some(payback);
        info!(contract = Self::CONTRACT_TYPE, "funds payback signed");
        Ok(())
    }

    pub fn funds_commit_raw_transaction(&self) -> Result<String, ContractError> {
        Ok(serialize_hex(&self.make_funds_commit_tx()?))
    }

    pub fn funds_pay_back_raw_transaction(&self) -> Result<String, ContractError> {
        let payback = self
            .funds_payback
            .as_ref()
            .ok_or_else(|| ContractError::State("funds payback is not signed".into()))?;
        Ok(serialize_hex(payback))
    }

    pub fn ord_swap_raw_transaction(&self) -> Result<String, ContractError> {
        Ok(serialize_hex(&self.make_swap_tx(true)?))
    }

    pub fn ord_payoff_raw_transaction(&self) -> Result<String, ContractError> {
        Ok(serialize_hex(&self.make_payoff_tx()?))
    }

    pub fn transaction_count(&self, phase: SwapPhase) -> usize {
        match phase {
            SwapPhase::OrdSwapSig | SwapPhase::FundsCommitSig => 1,
            SwapPhase::FundsSwapSig | SwapPhase::MarketSwapSig => 3,
            _ => 0,
        }
    }

    pub fn raw_transaction(&self, phase: SwapPhase, n: usize) -> Result<String, ContractError> {
        use SwapPhase::*;
        match (phase, n) {
            (OrdSwapSig, 0) => Ok(serialize_hex(&self.make_swap_tx(false)?)),
            (FundsCommitSig | FundsSwapSig | MarketSwapSig, 0) => self.funds_commit_raw_transaction(),
            (FundsSwapSig | MarketSwapSig, 1) => self.ord_swap_raw_transaction(),
            (FundsSwapSig | MarketSwapSig, 2) => self.ord_payoff_raw_transaction(),
            _ => Err(ContractError::State(format!(
                "{} has no transaction {n}",
                phase.as_str()
            ))),
        }
    }

    /// The ordinal as it arrives to the buyer.
    pub fn inscription_output(&self) -> Result<Utxo, ContractError> {
        let payoff = self.make_payoff_tx()?;
        let addr = state(&self.ord_payoff_addr, NAME_ORD_PAYOFF_ADDR)?.clone();
        Ok(Utxo::new(payoff.compute_txid(), 0, Destination::from_address(payoff.output[0].value, addr)?))
    }

    /// The price as it arrives to the seller.
    pub fn funds_output(&self) -> Result<Utxo, ContractError> {
        let swap = self.make_swap_tx(true)?;
        let addr = state(&self.funds_payoff_addr, NAME_FUNDS_PAYOFF_ADDR)?.clone();
        Ok(Utxo::new(swap.compute_txid(), 1, Destination::from_address(swap.output[1].value, addr)?))
    }

    pub fn change_output(&self) -> Result<Option<Utxo>, ContractError> {
        let Some(addr) = self.builder.change_addr() else {
            return Ok(None);
        };
        let commit = self.make_funds_commit_tx()?;
        match commit.output.get(1) {
            Some(out) => Ok(Some(Utxo::new(
                commit.compute_txid(),
                1,
                Destination::from_address(out.value, addr.clone())?,
            ))),
            None => Ok(None),
        }
    }

    fn check_address(&self, addr: &Address, version: u32, name: &str) -> Result<(), ContractError> {
        let dest = Destination::from_address(Amount::ZERO, addr.clone())?;
        check_p2address(&dest, version, LAST_NO_P2ADDRESS_VERSION, name)
    }

    fn check_market_fee(&self, version: u32) -> Result<(), ContractError> {
        let market_fee = self
            .builder
            .market_fee()
            .ok_or_else(|| ContractError::TermMissing(NAME_MARKET_FEE.into()))?;
        check_p2address(market_fee, version, LAST_NO_P2ADDRESS_VERSION, NAME_MARKET_FEE)
    }

    fn check_ord_swap_sig(&self) -> Result<(), ContractError> {
        let tx = self.make_swap_tx(false)?;
        verify_input(&tx, 0, &self.swap_prevouts(false)?)
            .map_err(|e| ContractError::Signature(NAME_ORD_UTXO.into()).caused_by(e))
    }

    fn check_funds_commit_sig(&self) -> Result<(), ContractError> {
        let tx = self.make_funds_commit_tx()?;
        let prevouts = self
            .funds
            .iter()
            .map(|input| input.utxo.tx_out())
            .collect::<Result<Vec<_>, _>>()?;
        for nin in 0..self.funds.len() {
            verify_input(&tx, nin, &prevouts)
                .map_err(|e| ContractError::Signature(format!("{NAME_FUNDS}[{nin}]")).caused_by(e))?;
        }
        Ok(())
    }

    fn check_escrow_sig(&self, sig: &Option<Vec<u8>>, pk: &Option<XOnlyPublicKey>, name: &str) -> Result<(), ContractError> {
        let sig = sig
            .as_ref()
            .ok_or_else(|| ContractError::TermMissing(name.to_owned()))?;
        let pk = state(pk, name)?;
        let escrow = self.escrow()?;
        let tx = self.make_swap_tx(true)?;
        verify_taproot_signature(pk, sig, &tx, ESCROW_NIN, &self.swap_prevouts(true)?, Some(&escrow.swap_script))
            .map_err(|e| ContractError::Signature(name.to_owned()).caused_by(e))
    }

    fn check_ord_payoff_sig(&self) -> Result<(), ContractError> {
        let sig = self
            .ord_payoff_sig
            .as_ref()
            .ok_or_else(|| ContractError::TermMissing(NAME_ORD_PAYOFF_SIG.into()))?;
        let pk_m = state(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
        let swap = self.make_swap_tx(true)?;
        verify_taproot_signature(pk_m, sig, &self.make_payoff_tx()?, 0, &swap.output[..1], None)
            .map_err(|e| ContractError::Signature(NAME_ORD_PAYOFF_SIG.into()).caused_by(e))
    }
}

impl PhasedContract for SwapInscriptionBuilder {
    type Phase = SwapPhase;
    type Params = SwapParams;

    const CONTRACT_TYPE: &'static str = "SwapInscription";
    const PROTOCOL_VERSION: u32 = 6;
    const SUPPORTED_VERSIONS: &'static [u32] = &[5, 6];

    fn make_params(&self, _version: u32, phase: SwapPhase) -> Result<SwapParams, ContractError> {
        use SwapPhase::*;
        let ord_sig = phase.reaches(OrdSwapSig);
        let funds_terms = phase.reaches(FundsTerms);
        let funds_sig = phase.reaches(FundsCommitSig);

        Ok(SwapParams {
            common: self.builder.make_params(funds_terms, true, funds_sig),
            ord_price: self.ord_price,
            ord_mining_fee_rate: self.ord_mining_fee_rate,
            swap_script_pk_m: self.swap_script_pk_m,
            swap_script_pk_b: self.swap_script_pk_b.filter(|_| funds_sig),
            ord_utxo: self
                .ord_input
                .as_ref()
                .filter(|_| ord_sig)
                .map(|input| input.to_repr(true)),
            funds_payoff_addr: self
                .funds_payoff_addr
                .as_ref()
                .filter(|_| ord_sig)
                .map(Address::to_string),
            ord_payoff_addr: self
                .ord_payoff_addr
                .as_ref()
                .filter(|_| funds_sig)
                .map(Address::to_string),
            funds: if funds_sig {
                self.funds.iter().map(|input| input.to_repr(true)).collect()
            } else {
                Vec::new()
            },
            funds_unspendable_key_factor: self.funds_unspendable_key_factor.filter(|_| funds_sig),
            ordpayoff_sig: self.ord_payoff_sig.clone().filter(|_| phase.reaches(MarketPayoffSig)),
            funds_swap_sig_b: self.funds_swap_sig_b.clone().filter(|_| phase.reaches(FundsSwapSig)),
            funds_swap_sig_m: self.funds_swap_sig_m.clone().filter(|_| phase.reaches(MarketSwapSig)),
        })
    }

    fn merge_params(&mut self, params: SwapParams, _version: u32, _phase: SwapPhase) -> Result<(), ContractError> {
        let network = self.builder.network();
        self.builder.merge_params(params.common)?;
        reconcile(&mut self.ord_price, params.ord_price, NAME_ORD_PRICE)?;
        reconcile(&mut self.ord_mining_fee_rate, params.ord_mining_fee_rate, NAME_ORD_MINING_FEE_RATE)?;
        reconcile(&mut self.swap_script_pk_m, params.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
        reconcile(&mut self.swap_script_pk_b, params.swap_script_pk_b, NAME_SWAP_SCRIPT_PK_B)?;
        reconcile(
            &mut self.funds_unspendable_key_factor,
            params.funds_unspendable_key_factor,
            NAME_FUNDS_UNSPENDABLE_KEY,
        )?;

        if let Some(repr) = params.ord_utxo {
            let input = TxInput::from_repr(repr, network)
                .map_err(|e| ContractError::TermWrongValue(NAME_ORD_UTXO.into()).caused_by(e))?;
            if !input.witness.is_complete() {
                return Err(ContractError::TermMissing(format!("{NAME_ORD_UTXO}.witness")));
            }
            reconcile_input(&mut self.ord_input, input, NAME_ORD_UTXO)?;
        }

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

        let funds = params
            .funds
            .into_iter()
            .enumerate()
            .map(|(i, repr)| {
                TxInput::from_repr(repr, network)
                    .map_err(|e| ContractError::TermWrongValue(format!("{NAME_FUNDS}[{i}]")).caused_by(e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(i) = funds.iter().position(|input| !input.witness.is_complete()) {
            return Err(ContractError::TermMissing(format!("{NAME_FUNDS}[{i}].witness")));
        }
        if !self.funds.is_empty() && !funds.is_empty() && self.funds.len() != funds.len() {
            return Err(ContractError::TermMismatch(format!("{NAME_FUNDS} size")));
        }
        reconcile_inputs(&mut self.funds, funds, NAME_FUNDS)?;

        reconcile(&mut self.ord_payoff_sig, params.ordpayoff_sig, NAME_ORD_PAYOFF_SIG)?;
        reconcile(&mut self.funds_swap_sig_b, params.funds_swap_sig_b, NAME_FUNDS_SWAP_SIG_B)?;
        reconcile(&mut self.funds_swap_sig_m, params.funds_swap_sig_m, NAME_FUNDS_SWAP_SIG_M)
    }

    fn check_phase_terms(&self, version: u32, phase: SwapPhase) -> Result<(), ContractError> {
        match phase {
            SwapPhase::OrdTerms => {
                self.check_market_fee(version)?;
                missing(&self.swap_script_pk_m, NAME_SWAP_SCRIPT_PK_M)?;
                missing(&self.ord_price, NAME_ORD_PRICE)?;
                missing(&self.ord_mining_fee_rate, NAME_ORD_MINING_FEE_RATE)
            }
            SwapPhase::OrdSwapSig => {
                let ord = self
                    .ord_input
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_ORD_UTXO.into()))?;
                check_p2address(&ord.utxo.destination, version, LAST_NO_P2ADDRESS_VERSION, NAME_ORD_UTXO)?;
                if !ord.witness.is_complete() {
                    return Err(ContractError::TermMissing(format!("{NAME_ORD_UTXO}.witness")));
                }
                let funds_payoff = self
                    .funds_payoff_addr
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_FUNDS_PAYOFF_ADDR.into()))?;
                self.check_address(funds_payoff, version, NAME_FUNDS_PAYOFF_ADDR)
            }
            SwapPhase::FundsTerms => {
                self.check_market_fee(version)?;
                missing(&self.ord_price, NAME_ORD_PRICE)?;
                missing(&self.builder.mining_fee_rate(), NAME_MINING_FEE_RATE)
            }
            SwapPhase::FundsCommitSig => {
                if self.funds.is_empty() {
                    return Err(ContractError::TermMissing(NAME_FUNDS.into()));
                }
                if let Some(i) = self.funds.iter().position(|input| !input.witness.is_complete()) {
                    return Err(ContractError::TermMissing(format!("{NAME_FUNDS}[{i}].witness")));
                }
                let provided: Amount = self.funds.iter().map(|input| input.utxo.amount()).sum();
                let required = self.get_min_funding_amount("")?;
                if provided < required {
                    return Err(ContractError::FundsNotEnough {
                        context: NAME_FUNDS.into(),
                        required: required.to_sat(),
                        available: provided.to_sat(),
                    });
                }
                missing(&self.swap_script_pk_b, NAME_SWAP_SCRIPT_PK_B)?;
                let ord_payoff = self
                    .ord_payoff_addr
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_ORD_PAYOFF_ADDR.into()))?;
                self.check_address(ord_payoff, version, NAME_ORD_PAYOFF_ADDR)?;
                missing(&self.funds_unspendable_key_factor, NAME_FUNDS_UNSPENDABLE_KEY)
            }
            SwapPhase::MarketPayoffTerms => Ok(()),
            SwapPhase::MarketPayoffSig => missing(&self.ord_payoff_sig, NAME_ORD_PAYOFF_SIG),
            SwapPhase::FundsSwapSig => missing(&self.funds_swap_sig_b, NAME_FUNDS_SWAP_SIG_B),
            SwapPhase::MarketSwapSig => missing(&self.funds_swap_sig_m, NAME_FUNDS_SWAP_SIG_M),
        }
    }

    fn check_phase_signatures(&self, phase: SwapPhase) -> Result<(), ContractError> {
        match phase {
            SwapPhase::OrdSwapSig => self.check_ord_swap_sig(),
            SwapPhase::FundsCommitSig => self.check_funds_commit_sig(),
            SwapPhase::MarketPayoffSig => self.check_ord_payoff_sig(),
            SwapPhase::FundsSwapSig => {
                self.check_escrow_sig(&self.funds_swap_sig_b, &self.swap_script_pk_b, NAME_FUNDS_SWAP_SIG_B)
            }
            SwapPhase::MarketSwapSig => {
                self.check_escrow_sig(&self.funds_swap_sig_m, &self.swap_script_pk_m, NAME_FUNDS_SWAP_SIG_M)
            }
            SwapPhase::OrdTerms | SwapPhase::FundsTerms | SwapPhase::MarketPayoffTerms => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use utxord_btc_types::{fee::paid_fee, ErrorKind};
    use utxord_test_utils::{fake_txid, p2tr_address, test_key_cache, TestKey};

    use super::*;

    fn market_terms() -> SwapInscriptionBuilder {
        let mut swap = SwapInscriptionBuilder::new(Network::Regtest);
        swap.set_ord_price(Amount::from_sat(10_000)).expect("price");
        swap.set_ord_mining_fee_rate(Amount::from_sat(1000)).expect("ord rate");
        swap.set_market_fee(Amount::from_sat(1000), &p2tr_address(TestKey::MarketFee).to_string())
            .expect("market fee");
        swap.set_swap_script_pk_m(TestKey::MarketScript.xonly()).expect("market pk");
        swap
    }

    fn funded() -> SwapInscriptionBuilder {
        let mut swap = market_terms();
        swap.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
        swap.ord_utxo(fake_txid(1), 0, Amount::from_sat(546), &p2tr_address(TestKey::Ord).to_string())
            .expect("ord");
        swap.set_funds_payoff_addr(&p2tr_address(TestKey::FundsPayoff).to_string())
            .expect("funds payoff");
        swap.set_swap_script_pk_b(TestKey::FundsScript.xonly()).expect("buyer pk");
        swap.set_ord_payoff_addr(&p2tr_address(TestKey::OrdPayoff).to_string())
            .expect("ord payoff");
        swap.set_funds_unspendable_key_factor(SecretKey::from_slice(&[42; 32]).expect("factor"))
            .expect("factor");
        swap
    }

    #[test]
    fn test_min_funding_covers_every_leg() {
        let swap = funded();
        let whole = swap.calculate_whole_fee("").expect("whole fee");
        let with_change = swap.calculate_whole_fee("change").expect("whole fee with change");
        assert_eq!(with_change - whole, Amount::from_sat(43));
        assert_eq!(
            swap.get_min_funding_amount("").expect("min funding"),
            Amount::from_sat(11_000) + whole
        );
        assert!(swap.calculate_whole_fee("collection").is_ok(), "known switch");
        assert!(swap.calculate_whole_fee("nonsense").is_err());
    }

    #[test]
    fn test_funds_commit_keeps_change() {
        let mut swap = funded();
        swap.set_change_addr(&p2tr_address(TestKey::Change).to_string()).expect("change");
        let min = swap.get_min_funding_amount("change").expect("min funding");
        swap.add_funds_utxo(fake_txid(2), 0, min + Amount::from_sat(5000), &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");

        let commit = swap.make_funds_commit_tx().expect("funds commit");
        assert_eq!(commit.output.len(), 2);
        assert_eq!(commit.output[0].value, swap.escrow_amount().expect("escrow"));
        assert_eq!(commit.output[1].value, Amount::from_sat(5000));
        assert_eq!(
            paid_fee(min + Amount::from_sat(5000), &commit),
            Some(tx_fee(Amount::from_sat(1000), commit.vsize()))
        );
    }

    #[test]
    fn test_funds_commit_takes_everything_without_change() {
        let mut swap = funded();
        let min = swap.get_min_funding_amount("").expect("min funding");
        swap.add_funds_utxo(fake_txid(2), 0, min + Amount::from_sat(100), &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");

        let commit = swap.make_funds_commit_tx().expect("funds commit");
        assert_eq!(commit.output.len(), 1);
        assert_eq!(
            commit.output[0].value,
            swap.escrow_amount().expect("escrow") + Amount::from_sat(100)
        );
    }

    #[test]
    fn test_short_funds_are_rejected() {
        let mut swap = funded();
        swap.add_funds_utxo(fake_txid(2), 0, Amount::from_sat(5000), &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");
        let err = swap.make_funds_commit_tx().expect_err("not enough");
        assert_eq!(err.kind(), ErrorKind::FundsNotEnough);
    }

    #[test]
    fn test_escrow_key_is_provably_unspendable() {
        let swap = funded();
        let escrow = swap.escrow().expect("escrow");
        let factor = SecretKey::from_slice(&[42; 32]).expect("factor");
        assert!(utxord_taproot::verify_unspendable_key(
            &escrow.commitment.internal_key(),
            &factor
        ));
        assert_eq!(escrow.commitment.depth(&escrow.swap_script), Some(1));
        assert_eq!(escrow.commitment.depth(&escrow.refund_script), Some(1));
    }

    #[test]
    fn test_seller_signature_survives_funding() {
        let cache = test_key_cache();
        let mut swap = funded();
        swap.sign_ord_swap(&cache, "").expect("seller signs");
        swap.check_ord_swap_sig().expect("seller view verifies");

        swap.add_funds_utxo(fake_txid(2), 0, Amount::from_sat(20_000), &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");
        let tx = swap.make_swap_tx(true).expect("funded swap");
        verify_input(&tx, 0, &swap.swap_prevouts(true).expect("prevouts")).expect("ANYONECANPAY keeps the signature valid");
    }

    #[test]
    fn test_escrow_amount_ignores_seller_terms() {
        let cache = test_key_cache();
        let mut buyer_view = market_terms();
        buyer_view.set_mining_fee_rate(Amount::from_sat(1000)).expect("rate");
        let expected = buyer_view.escrow_amount().expect("escrow before the seller terms");

        let mut swap = funded();
        assert_eq!(swap.escrow_amount(), Ok(expected));
        swap.sign_ord_swap(&cache, "").expect("seller signs");
        assert_eq!(swap.escrow_amount(), Ok(expected), "the real seller signature changes nothing");

        swap.add_funds_utxo(fake_txid(2), 0, Amount::from_sat(20_000), &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");
        let tx = swap.make_swap_tx(true).expect("funded swap");
        let template = swap.swap_tx_template().expect("template");
        assert_eq!(tx.input[0].witness.nth(0).map(<[u8]>::len), Some(65));
        assert_eq!(tx.vsize(), template.vsize());
    }

    #[test]
    fn test_funds_are_fixed_once_signed() {
        let cache = test_key_cache();
        let mut swap = funded();
        swap.set_change_addr(&p2tr_address(TestKey::Change).to_string()).expect("change");
        let min = swap.get_min_funding_amount("change").expect("min funding");
        swap.add_funds_utxo(fake_txid(2), 0, min, &p2tr_address(TestKey::Funds).to_string())
            .expect("funds");
        swap.sign_funds_commitment(&cache, "").expect("funds signed");

        let err = swap
            .add_funds_utxo(fake_txid(3), 0, Amount::from_sat(5000), &p2tr_address(TestKey::Funds).to_string())
            .expect_err("signed funds are final");
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(swap.funds.len(), 1);
        swap.check_funds_commit_sig().expect("signature still matches");
    }

    #[test]
    fn test_v5_rejects_legacy_market_fee_address() {
        let mut swap = SwapInscriptionBuilder::new(Network::Regtest);
        let legacy = Address::p2pkh(
            bitcoin::CompressedPublicKey(TestKey::MarketFee.keypair().public_key()).pubkey_hash(),
            Network::Regtest,
        );
        swap.set_market_fee(Amount::from_sat(1000), &legacy.to_string()).expect("fee");
        assert_eq!(swap.check_market_fee(5).map_err(|e| e.kind()), Err(ErrorKind::Protocol));
        assert!(swap.check_market_fee(6).is_ok());
    }
}
