use bitcoin::{
    absolute::LockTime,
    consensus::encode::{serialize, serialize_hex},
    hashes::Hash,
    key::TweakedPublicKey,
    opcodes::all::OP_CHECKSIG,
    script::Builder,
    secp256k1::XOnlyPublicKey,
    transaction::Version,
    Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use tracing::*;
use utxord_btc_types::{
    fee::{
        tx_fee, FeeOptions, COLLECTION_SCRIPT_ADD_VSIZE, P2WPKH_VIN_VSIZE, TAPROOT_KEYSPEND_VIN_VSIZE,
        TAPROOT_MULTISIG_VIN_VSIZE, TAPROOT_VOUT_VSIZE, TX_BASE_VSIZE,
    },
    sign_destination, sign_taproot, verify_input, verify_taproot_signature, ContractError,
    Destination, DestinationRepr, KeyRegistry, TxInput, Utxo, UtxoRepr,
};
use utxord_config::Config;
use utxord_taproot::{multisig_2of2, nums_point, TaprootCommitment};

use super::{inscription_script, Envelope, InscriptionId, InscriptionPhase, InscriptionType};
use crate::{
    builder::{
        check_p2address, CommonParams, ContractBuilder, NAME_CHANGE_ADDR, NAME_MARKET_FEE,
        NAME_MINING_FEE_RATE,
    },
    reconcile, reconcile_input, reconcile_inputs, ContractPhase, PhasedContract,
};

pub const NAME_ORD: &str = "ord";
pub const NAME_ORD_AMOUNT: &str = "ord_amount";
pub const NAME_DESTINATION_ADDR: &str = "destination_addr";
pub const NAME_UTXO: &str = "utxo";
pub const NAME_INSCRIPTION_TYPE: &str = "inscription_type";
pub const NAME_COLLECTION: &str = "collection";
pub const NAME_COLLECTION_ID: &str = "collection_id";
pub const NAME_COLLECTION_DESTINATION: &str = "collection_destination";
pub const NAME_CONTENT_TYPE: &str = "content_type";
pub const NAME_CONTENT: &str = "content";
pub const NAME_METADATA: &str = "metadata";
pub const NAME_DELEGATE: &str = "delegate";
pub const NAME_INSCRIBE_SCRIPT_PK: &str = "inscribe_script_pk";
pub const NAME_INSCRIBE_INT_PK: &str = "inscribe_int_pk";
pub const NAME_INSCRIBE_SCRIPT_MARKET_PK: &str = "inscribe_script_market_pk";
pub const NAME_FUND_MINING_FEE_INT_PK: &str = "fund_mining_fee_int_pk";
pub const NAME_INSCRIBE_SIG: &str = "inscribe_sig";
pub const NAME_INSCRIBE_MARKET_SIG: &str = "inscribe_market_sig";
pub const NAME_FUND_MINING_FEE_SIG: &str = "fund_mining_fee_sig";
pub const NAME_FUND_MINING_FEE_MARKET_SIG: &str = "fund_mining_fee_market_sig";
pub const NAME_AUTHOR_FEE: &str = "author_fee";
pub const NAME_FIXED_CHANGE: &str = "fixed_change";

const LAST_NO_FIXED_CHANGE_VERSION: u32 = 8;
const LAST_LEGACY_ORD_VERSION: u32 = 9;
const LAST_NO_CUSTOM_FEE_VERSION: u32 = 10;
const LAST_NO_P2ADDRESS_VERSION: u32 = 11;

/// Genesis input spending the commit output with the envelope.
const GENESIS_NIN: usize = 0;
const COLLECTION_NIN: usize = 1;
/// Genesis input spending the commit output that pays the fees of a collection genesis.
const FUND_MINING_FEE_NIN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRepr {
    pub collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utxo: Option<UtxoRepr>,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InscriptionParams {
    #[serde(flatten)]
    pub common: CommonParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscription_type: Option<InscriptionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ord: Option<DestinationRepr>,
    /// Ordinal destination as written up to version 9.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bitcoin::amount::serde::as_sat::opt"
    )]
    pub ord_amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utxo: Vec<UtxoRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_destination: Option<DestinationRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscribe_script_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscribe_int_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscribe_script_market_pk: Option<XOnlyPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_mining_fee_int_pk: Option<XOnlyPublicKey>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscribe_sig: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inscribe_market_sig: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_mining_fee_sig: Option<Vec<u8>>,
    #[serde_as(as = "Option<Hex>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_mining_fee_market_sig: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_fee: Option<DestinationRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_change: Option<DestinationRepr>,
}

/// Builder of the `CreateInscription` contract.
///
/// The commit transaction pays `[genesis, fund mining fee?, fixed change?, change?]`: the
/// genesis output carries the ordinal amount and, without a parent collection, every fee of
/// the genesis transaction. With a parent collection those fees go to a separate output that
/// the genesis spends next to the collection UTXO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InscriptionBuilder {
    builder: ContractBuilder,
    inscription_type: InscriptionType,
    ord: Option<Destination>,
    inputs: Vec<TxInput>,
    envelope: Envelope,
    collection_destination: Option<Destination>,
    collection_input: Option<TxInput>,
    inscribe_script_pk: Option<XOnlyPublicKey>,
    inscribe_int_pk: Option<XOnlyPublicKey>,
    inscribe_script_market_pk: Option<XOnlyPublicKey>,
    fund_mining_fee_int_pk: Option<XOnlyPublicKey>,
    inscribe_sig: Option<Vec<u8>>,
    inscribe_market_sig: Option<Vec<u8>>,
    fund_mining_fee_sig: Option<Vec<u8>>,
    fund_mining_fee_market_sig: Option<Vec<u8>>,
    author_fee: Option<Destination>,
    fixed_change: Option<Destination>,
}

fn state<'a, T>(value: &'a Option<T>, name: &str) -> Result<&'a T, ContractError> {
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

fn stub_key() -> Result<XOnlyPublicKey, ContractError> {
    nums_point().map_err(|e| ContractError::Key(format!("nums point: {e}")))
}

fn raw_p2tr(key: XOnlyPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(key))
}

fn sig_or_placeholder(sig: &Option<Vec<u8>>, len: usize) -> Vec<u8> {
    sig.clone().unwrap_or_else(|| vec![0; len])
}

fn read_destination(repr: DestinationRepr, network: Network, name: &str) -> Result<Destination, ContractError> {
    Destination::from_repr(repr, network).map_err(|e| ContractError::TermWrongValue(name.to_owned()).caused_by(e))
}

fn read_input(repr: UtxoRepr, network: Network, name: &str) -> Result<TxInput, ContractError> {
    TxInput::from_repr(repr, network).map_err(|e| ContractError::TermWrongValue(name.to_owned()).caused_by(e))
}

impl InscriptionBuilder {
    pub fn new(network: Network, inscription_type: InscriptionType) -> Self {
        Self::with_config(
            &Config {
                network,
                ..Config::default()
            },
            inscription_type,
        )
    }

    pub fn with_config(config: &Config, inscription_type: InscriptionType) -> Self {
        Self {
            builder: ContractBuilder::new(config),
            inscription_type,
            ord: None,
            inputs: Vec::new(),
            envelope: Envelope::default(),
            collection_destination: None,
            collection_input: None,
            inscribe_script_pk: None,
            inscribe_int_pk: None,
            inscribe_script_market_pk: None,
            fund_mining_fee_int_pk: None,
            inscribe_sig: None,
            inscribe_market_sig: None,
            fund_mining_fee_sig: None,
            fund_mining_fee_market_sig: None,
            author_fee: None,
            fixed_change: None,
        }
    }

    pub fn inscription_type(&self) -> InscriptionType {
        self.inscription_type
    }

    fn is_lazy(&self) -> bool {
        self.inscription_type == InscriptionType::LazyInscription
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

    pub fn add_custom_fee(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        self.builder.add_custom_fee(amount, addr)
    }

    pub fn set_change_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        self.builder.set_change_addr(addr)
    }

    /// Where the inscription lands and the amount it carries.
    pub fn set_ord_destination(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let ord = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(NAME_ORD.into()).caused_by(e))?;
        self.builder.check_dust(&ord, NAME_ORD)?;
        reconcile(&mut self.ord, Some(ord), NAME_ORD)
    }

    pub fn add_utxo(&mut self, txid: Txid, nout: u32, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let name = format!("{NAME_UTXO}[{}]", self.inputs.len());
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(name).caused_by(e))?;
        self.inputs.push(TxInput::new(Utxo::new(txid, nout, destination)));
        Ok(())
    }

    pub fn set_data(&mut self, content_type: &str, content: Vec<u8>) -> Result<(), ContractError> {
        if self.envelope.delegate.is_some() {
            return Err(ContractError::TermMismatch(format!("{NAME_CONTENT} conflicts {NAME_DELEGATE}")));
        }
        reconcile(&mut self.envelope.content_type, Some(content_type.to_owned()), NAME_CONTENT_TYPE)?;
        reconcile(&mut self.envelope.content, Some(content), NAME_CONTENT)
    }

    /// CBOR encoded metadata.
    pub fn set_metadata(&mut self, metadata: Vec<u8>) -> Result<(), ContractError> {
        reconcile(&mut self.envelope.metadata, Some(metadata), NAME_METADATA)
    }

    /// Reveals no content of its own and points to `inscription_id` instead.
    pub fn set_delegate(&mut self, inscription_id: &str) -> Result<(), ContractError> {
        if self.envelope.content.is_some() {
            return Err(ContractError::TermMismatch(format!("{NAME_CONTENT} conflicts {NAME_DELEGATE}")));
        }
        let id: InscriptionId = inscription_id.parse()?;
        reconcile(&mut self.envelope.delegate, Some(id), NAME_DELEGATE)
    }

    pub fn set_inscribe_script_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.inscribe_script_pk, Some(pk), NAME_INSCRIBE_SCRIPT_PK)
    }

    pub fn set_inscribe_int_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.inscribe_int_pk, Some(pk), NAME_INSCRIBE_INT_PK)
    }

    pub fn set_inscribe_script_market_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.inscribe_script_market_pk, Some(pk), NAME_INSCRIBE_SCRIPT_MARKET_PK)
    }

    pub fn set_fund_mining_fee_int_pk(&mut self, pk: XOnlyPublicKey) -> Result<(), ContractError> {
        reconcile(&mut self.fund_mining_fee_int_pk, Some(pk), NAME_FUND_MINING_FEE_INT_PK)
    }

    pub fn set_author_fee(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let fee = self.builder.fee_destination(amount, addr, NAME_AUTHOR_FEE)?;
        reconcile(&mut self.author_fee, Some(fee), NAME_AUTHOR_FEE)
    }

    /// Change of a known amount paid ahead of the computed change.
    pub fn set_fixed_change(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let change = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(NAME_FIXED_CHANGE.into()).caused_by(e))?;
        self.builder.check_dust(&change, NAME_FIXED_CHANGE)?;
        reconcile(&mut self.fixed_change, Some(change), NAME_FIXED_CHANGE)
    }

    /// Makes the inscription a child of `collection_id`, whose UTXO comes back to `addr`.
    pub fn set_collection(&mut self, collection_id: &str, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let id: InscriptionId = collection_id.parse()?;
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(NAME_COLLECTION_DESTINATION.into()).caused_by(e))?;
        reconcile(&mut self.envelope.parent, Some(id), NAME_COLLECTION_ID)?;
        reconcile(&mut self.collection_destination, Some(destination), NAME_COLLECTION_DESTINATION)
    }

    /// Sends the collection to another address, keeping its amount.
    pub fn override_collection_address(&mut self, addr: &str) -> Result<(), ContractError> {
        let amount = state(&self.collection_destination, NAME_COLLECTION_DESTINATION)?.amount();
        self.collection_destination = Some(Destination::from_addr_str(amount, addr, self.builder.network())?);
        Ok(())
    }

    pub fn add_collection_utxo(
        &mut self,
        txid: Txid,
        nout: u32,
        amount: Amount,
        addr: &str,
    ) -> Result<(), ContractError> {
        let destination = Destination::from_addr_str(amount, addr, self.builder.network())
            .map_err(|e| ContractError::TermWrongValue(NAME_COLLECTION.into()).caused_by(e))?;
        reconcile_input(&mut self.collection_input, TxInput::new(Utxo::new(txid, nout, destination)), NAME_COLLECTION)
    }

    fn has_parent(&self) -> bool {
        self.envelope.parent.is_some()
    }

    fn fixed_fees(&self) -> Amount {
        let mut fees =
            self.builder.market_fee().map_or(Amount::ZERO, Destination::amount) + self.builder.custom_fees_amount();
        if let Some(author_fee) = &self.author_fee {
            fees += author_fee.amount();
        }
        fees
    }

    fn script_head(&self, template: bool) -> Result<ScriptBuf, ContractError> {
        let key = |pk: &Option<XOnlyPublicKey>, name: &str| match (pk, template) {
            (Some(pk), _) => Ok(*pk),
            (None, true) => stub_key(),
            (None, false) => Err(ContractError::State(format!("{name} not defined"))),
        };
        let inscribe_pk = key(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        if self.is_lazy() {
            let market_pk = key(&self.inscribe_script_market_pk, NAME_INSCRIBE_SCRIPT_MARKET_PK)?;
            Ok(multisig_2of2(&inscribe_pk, &market_pk))
        } else {
            Ok(Builder::new()
                .push_x_only_key(&inscribe_pk)
                .push_opcode(OP_CHECKSIG)
                .into_script())
        }
    }

    /// Leaf with the envelope and the taproot commitment of the genesis output.
    pub fn genesis_commitment(&self) -> Result<(ScriptBuf, TaprootCommitment), ContractError> {
        let int_pk = *state(&self.inscribe_int_pk, NAME_INSCRIBE_INT_PK)?;
        if self.is_lazy() && !self.has_parent() {
            return Err(ContractError::State(format!("{NAME_COLLECTION_ID} not defined")));
        }
        let script = inscription_script(&self.script_head(false)?, &self.envelope)?;
        let commitment = TaprootCommitment::new(int_pk, [script.clone()]);
        Ok((script, commitment))
    }

    fn fund_mining_fee_commitment(&self) -> Result<(ScriptBuf, TaprootCommitment), ContractError> {
        let inscribe_pk = state(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        let market_pk = state(&self.inscribe_script_market_pk, NAME_INSCRIBE_SCRIPT_MARKET_PK)?;
        let int_pk = *state(&self.fund_mining_fee_int_pk, NAME_FUND_MINING_FEE_INT_PK)?;
        let script = multisig_2of2(inscribe_pk, market_pk);
        let commitment = TaprootCommitment::new(int_pk, [script.clone()]);
        Ok((script, commitment))
    }

    fn fund_mining_fee_script_pubkey(&self) -> Result<ScriptBuf, ContractError> {
        if self.is_lazy() {
            Ok(self.fund_mining_fee_commitment()?.1.script_pubkey())
        } else {
            Ok(raw_p2tr(*state(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?))
        }
    }

    fn genesis_witness_sigs(&self) -> Vec<Vec<u8>> {
        if self.is_lazy() {
            vec![sig_or_placeholder(&self.inscribe_market_sig, 64), sig_or_placeholder(&self.inscribe_sig, 65)]
        } else {
            vec![sig_or_placeholder(&self.inscribe_sig, 64)]
        }
    }

    fn fee_outputs(&self) -> Result<Vec<TxOut>, ContractError> {
        let mut outputs = Vec::new();
        if let Some(market_fee) = self.builder.market_fee().filter(|fee| fee.amount() > Amount::ZERO) {
            outputs.push(market_fee.required_tx_out()?);
        }
        if let Some(author_fee) = self.author_fee.as_ref().filter(|fee| fee.amount() > Amount::ZERO) {
            outputs.push(author_fee.required_tx_out()?);
        }
        for fee in self.builder.custom_fees() {
            outputs.push(fee.required_tx_out()?);
        }
        Ok(outputs)
    }

    /// Single input genesis of final size, with stand-in keys where they are not known yet.
    fn genesis_template(&self) -> Result<Transaction, ContractError> {
        let script = inscription_script(&self.script_head(true)?, &self.envelope)?;
        let int_pk = match self.inscribe_int_pk {
            Some(pk) => pk,
            None => stub_key()?,
        };
        let control_block = TaprootCommitment::new(int_pk, [script.clone()])
            .control_block(&script)
            .ok_or_else(|| ContractError::State("genesis script is not committed".into()))?;

        let mut witness = self.genesis_witness_sigs();
        witness.push(script.to_bytes());
        witness.push(control_block.serialize());

        let ord_out = match &self.ord {
            Some(ord) => ord.required_tx_out()?,
            None => TxOut {
                value: Amount::ZERO,
                script_pubkey: raw_p2tr(stub_key()?),
            },
        };
        let mut output = vec![ord_out];
        output.extend(self.fee_outputs()?);

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                witness: Witness::from_slice(&witness),
                ..TxIn::default()
            }],
            output,
        })
    }

    /// Extra genesis size when a parent collection is spent along with the fund mining fee
    /// output.
    fn collection_genesis_vsize(&self) -> usize {
        let fund_vin = if self.is_lazy() {
            TAPROOT_MULTISIG_VIN_VSIZE + 1
        } else {
            TAPROOT_KEYSPEND_VIN_VSIZE
        };
        TAPROOT_KEYSPEND_VIN_VSIZE + TAPROOT_VOUT_VSIZE + fund_vin
    }

    /// Everything the commit transaction forwards to the genesis beyond the ordinal amount.
    fn genesis_sum_fee(&self) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let mut fee = tx_fee(rate, self.genesis_template()?.vsize()) + self.fixed_fees();
        if self.has_parent() {
            fee += tx_fee(rate, self.collection_genesis_vsize());
        }
        Ok(fee)
    }

    /// Mining fee of the genesis alone.
    pub fn get_genesis_tx_mining_fee(&self) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let mut fee = tx_fee(rate, self.genesis_template()?.vsize());
        if self.has_parent() {
            fee += tx_fee(rate, self.collection_genesis_vsize());
        }
        Ok(fee)
    }

    fn commit_tx_shape(&self, with_change: bool) -> Result<(Transaction, Amount), ContractError> {
        let ord = state(&self.ord, NAME_ORD)?;
        let (_, genesis) = self.genesis_commitment()?;
        let sum_fee = self.genesis_sum_fee()?;

        let mut output = vec![TxOut {
            value: ord.amount(),
            script_pubkey: genesis.script_pubkey(),
        }];
        if self.has_parent() {
            output.push(TxOut {
                value: sum_fee,
                script_pubkey: self.fund_mining_fee_script_pubkey()?,
            });
        } else {
            output[0].value += sum_fee;
        }
        if let Some(fixed_change) = &self.fixed_change {
            output.push(fixed_change.required_tx_out()?);
        }
        if with_change {
            let change_addr = self.builder.require_change_addr()?;
            output.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: change_addr.script_pubkey(),
            });
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.inputs.iter().map(TxInput::to_txin).collect::<Result<_, _>>()?,
            output,
        };
        let required = ord.amount() + sum_fee + self.fixed_change.as_ref().map_or(Amount::ZERO, Destination::amount);
        Ok((tx, required))
    }

    /// Commit transaction with the change solved.
    ///
    /// Change below dust is dropped and its amount left in the output before it.
    pub fn make_commit_tx(&self) -> Result<Transaction, ContractError> {
        if self.inputs.is_empty() {
            return Err(ContractError::TermMissing(NAME_UTXO.into()));
        }
        let rate = self.builder.require_mining_fee_rate()?;
        let total: Amount = self.inputs.iter().map(|input| input.utxo.amount()).sum();

        if let Some(change_addr) = self.builder.change_addr() {
            let (mut tx, required) = self.commit_tx_shape(true)?;
            let fee = tx_fee(rate, tx.vsize());
            let change = total
                .checked_sub(required + fee)
                .map(|amount| Destination::from_address(amount, change_addr.clone()))
                .transpose()?;
            if let Some(change) = change {
                if !self.builder.is_dust(&change) {
                    if let Some(out) = tx.output.last_mut() {
                        out.value = change.amount();
                    }
                    return Ok(tx);
                }
                warn!(change = %change.amount(), "commit change is dust, leaving it to the last output");
            }
        }

        let (mut tx, required) = self.commit_tx_shape(false)?;
        let fee = tx_fee(rate, tx.vsize());
        let excess = total.checked_sub(required + fee).ok_or_else(|| ContractError::FundsNotEnough {
            context: NAME_UTXO.into(),
            required: (required + fee).to_sat(),
            available: total.to_sat(),
        })?;
        if self.builder.change_addr().is_some() {
            if let Some(out) = tx.output.last_mut() {
                out.value += excess;
            }
        }
        Ok(tx)
    }

    fn collection_prevout(&self) -> Result<TxOut, ContractError> {
        match &self.collection_input {
            Some(input) => input.utxo.tx_out(),
            None => state(&self.collection_destination, NAME_COLLECTION_DESTINATION)?.required_tx_out(),
        }
    }

    fn genesis_spends(&self, commit: &Transaction) -> Result<Vec<TxOut>, ContractError> {
        let mut spends = vec![commit.output[0].clone()];
        if self.has_parent() {
            spends.push(self.collection_prevout()?);
            let fund = commit
                .output
                .get(1)
                .ok_or_else(|| ContractError::State("fund mining fee output not found".into()))?;
            spends.push(fund.clone());
        }
        Ok(spends)
    }

    pub fn make_genesis_tx(&self, commit: &Transaction) -> Result<Transaction, ContractError> {
        let ord = state(&self.ord, NAME_ORD)?;
        let (script, genesis) = self.genesis_commitment()?;
        let control_block = genesis
            .control_block(&script)
            .ok_or_else(|| ContractError::State("genesis script is not committed".into()))?;
        let commit_txid = commit.compute_txid();

        let mut witness = self.genesis_witness_sigs();
        witness.push(script.to_bytes());
        witness.push(control_block.serialize());

        let mut input = vec![TxIn {
            previous_output: OutPoint::new(commit_txid, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::from_slice(&witness),
        }];
        let mut output = vec![ord.required_tx_out()?];

        if self.has_parent() {
            input.push(match &self.collection_input {
                Some(collection) => collection.to_txin()?,
                None => TxIn {
                    witness: Witness::from_slice(&[vec![0u8; 64]]),
                    ..TxIn::default()
                },
            });

            let fund_witness = if self.is_lazy() {
                let (fund_script, fund) = self.fund_mining_fee_commitment()?;
                let fund_cb = fund
                    .control_block(&fund_script)
                    .ok_or_else(|| ContractError::State("fund mining fee script is not committed".into()))?;
                vec![
                    sig_or_placeholder(&self.fund_mining_fee_market_sig, 64),
                    sig_or_placeholder(&self.fund_mining_fee_sig, 65),
                    fund_script.to_bytes(),
                    fund_cb.serialize(),
                ]
            } else {
                vec![sig_or_placeholder(&self.fund_mining_fee_sig, 64)]
            };
            input.push(TxIn {
                previous_output: OutPoint::new(commit_txid, 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::from_slice(&fund_witness),
            });

            output.push(state(&self.collection_destination, NAME_COLLECTION_DESTINATION)?.required_tx_out()?);
        }
        output.extend(self.fee_outputs()?);

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        })
    }

    pub fn make_inscription_id(&self) -> Result<String, ContractError> {
        let genesis = self.make_genesis_tx(&self.make_commit_tx()?)?;
        Ok(InscriptionId::new(genesis.compute_txid(), 0).to_string())
    }

    /// Signs every commit input.
    pub fn sign_commit(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        missing(&self.inscribe_int_pk, NAME_INSCRIBE_INT_PK)?;
        missing(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        if self.is_lazy() {
            missing(&self.inscribe_script_market_pk, NAME_INSCRIBE_SCRIPT_MARKET_PK)?;
            missing(&self.fund_mining_fee_int_pk, NAME_FUND_MINING_FEE_INT_PK)?;
        }

        let tx = self.make_commit_tx()?;
        let prevouts = self
            .inputs
            .iter()
            .map(|input| input.utxo.tx_out())
            .collect::<Result<Vec<_>, _>>()?;
        let mut inputs = self.inputs.clone();
        for (nin, input) in inputs.iter_mut().enumerate() {
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
        self.inputs = inputs;
        info!(contract = Self::CONTRACT_TYPE, txid = %tx.compute_txid(), "commit signed");
        Ok(())
    }

    /// Author signature of the genesis.
    ///
    /// A lazy inscription signs the envelope input with `SIGHASH_SINGLE|ANYONECANPAY` and the
    /// fund mining fee input with `SIGHASH_NONE|ANYONECANPAY`, leaving the market free to attach
    /// the collection.
    pub fn sign_inscription(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        let pk = *state(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        let key = registry.lookup(&pk.to_string(), filter)?;
        if key.x_only_public_key() != pk {
            return Err(ContractError::TermMismatch(NAME_INSCRIBE_SCRIPT_PK.into()));
        }
        if !self.is_lazy() && self.has_parent() {
            missing(&self.collection_input, NAME_COLLECTION)?;
        }

        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        let spends = self.genesis_spends(&commit)?;
        let (script, _) = self.genesis_commitment()?;

        let sighash_type = if self.is_lazy() {
            TapSighashType::SinglePlusAnyoneCanPay
        } else {
            TapSighashType::Default
        };
        let inscribe_sig = sign_taproot(key.keypair(), &genesis, GENESIS_NIN, &spends, Some(&script), sighash_type)?;

        let fund_sig = if !self.has_parent() {
            None
        } else if self.is_lazy() {
            let (fund_script, _) = self.fund_mining_fee_commitment()?;
            Some(sign_taproot(
                key.keypair(),
                &genesis,
                FUND_MINING_FEE_NIN,
                &spends,
                Some(&fund_script),
                TapSighashType::NonePlusAnyoneCanPay,
            )?)
        } else {
            Some(sign_taproot(key.keypair(), &genesis, FUND_MINING_FEE_NIN, &spends, None, TapSighashType::Default)?)
        };

        self.inscribe_sig = Some(inscribe_sig);
        self.fund_mining_fee_sig = fund_sig;
        info!(contract = Self::CONTRACT_TYPE, "inscription signed by author");
        Ok(())
    }

    /// Signs the parent collection input of the genesis.
    pub fn sign_collection(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        missing(&self.envelope.parent, NAME_COLLECTION_ID)?;
        let collection = state(&self.collection_input, NAME_COLLECTION)?;

        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        let spends = self.genesis_spends(&commit)?;
        let witness = sign_destination(
            registry,
            filter,
            &collection.utxo.destination,
            &genesis,
            COLLECTION_NIN,
            &spends,
            TapSighashType::Default,
        )?;
        if let Some(collection) = self.collection_input.as_mut() {
            collection.witness.merge(&witness)?;
        }
        info!(contract = Self::CONTRACT_TYPE, "collection signed");
        Ok(())
    }

    /// Market co-signature of a lazy inscription genesis.
    pub fn market_sign_inscription(&mut self, registry: &dyn KeyRegistry, filter: &str) -> Result<(), ContractError> {
        if !self.is_lazy() {
            return Err(ContractError::TermWrongValue(NAME_INSCRIPTION_TYPE.into()));
        }
        let pk = *state(&self.inscribe_script_market_pk, NAME_INSCRIBE_SCRIPT_MARKET_PK)?;
        let key = registry.lookup(&pk.to_string(), filter)?;
        if key.x_only_public_key() != pk {
            return Err(ContractError::TermMismatch(NAME_INSCRIBE_SCRIPT_MARKET_PK.into()));
        }

        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        let spends = self.genesis_spends(&commit)?;
        let (script, _) = self.genesis_commitment()?;

        let market_sig =
            sign_taproot(key.keypair(), &genesis, GENESIS_NIN, &spends, Some(&script), TapSighashType::Default)?;
        let fund_sig = if self.has_parent() {
            let (fund_script, _) = self.fund_mining_fee_commitment()?;
            Some(sign_taproot(
                key.keypair(),
                &genesis,
                FUND_MINING_FEE_NIN,
                &spends,
                Some(&fund_script),
                TapSighashType::Default,
            )?)
        } else {
            None
        };

        self.inscribe_market_sig = Some(market_sig);
        self.fund_mining_fee_market_sig = fund_sig;
        info!(contract = Self::CONTRACT_TYPE, "inscription signed by market");
        Ok(())
    }

    /// Mining fees of both transactions.
    ///
    /// Options: `change`, `collection`, `p2wpkh_utxo`.
    pub fn calculate_whole_fee(&self, options: &str) -> Result<Amount, ContractError> {
        let opts: FeeOptions = options.parse()?;
        let rate = self.builder.quote_mining_fee_rate();
        let genesis_fee = tx_fee(rate, self.genesis_template()?.vsize());

        let collection = opts.collection || self.has_parent();
        let mut genesis_add = 0;
        if opts.collection && !self.has_parent() {
            genesis_add += COLLECTION_SCRIPT_ADD_VSIZE;
        }
        if self.is_lazy() || collection {
            genesis_add += self.collection_genesis_vsize();
        }

        let vin = if opts.p2wpkh_utxo {
            P2WPKH_VIN_VSIZE
        } else {
            TAPROOT_KEYSPEND_VIN_VSIZE
        };
        let mut commit_vsize = TX_BASE_VSIZE + TAPROOT_VOUT_VSIZE + vin * self.inputs.len().max(1);
        if opts.change {
            commit_vsize += TAPROOT_VOUT_VSIZE;
        }
        if collection {
            commit_vsize += TAPROOT_VOUT_VSIZE;
        }
        if let Some(fixed_change) = &self.fixed_change {
            commit_vsize += serialize(&fixed_change.required_tx_out()?).len();
        }

        Ok(genesis_fee + tx_fee(rate, genesis_add + commit_vsize))
    }

    /// Funds the commit inputs need to carry, fees included.
    pub fn get_min_funding_amount(&self, options: &str) -> Result<Amount, ContractError> {
        let ord = state(&self.ord, NAME_ORD)?;
        self.builder.require_market_fee()?;
        if self.is_lazy() {
            missing(&self.author_fee, NAME_AUTHOR_FEE)?;
        }
        let fixed_change = self.fixed_change.as_ref().map_or(Amount::ZERO, Destination::amount);
        Ok(ord.amount() + self.fixed_fees() + fixed_change + self.calculate_whole_fee(options)?)
    }

    /// Amount still missing from the commit inputs, zero when they are enough.
    ///
    /// With `addr` the fee of one more input from that address is included and the result is
    /// never below its dust limit.
    pub fn calculate_missing_amount(&self, addr: Option<&str>) -> Result<Amount, ContractError> {
        let rate = self.builder.quote_mining_fee_rate();
        let total: Amount = self.inputs.iter().map(|input| input.utxo.amount()).sum();
        let required = |contract: &Self| -> Result<Amount, ContractError> {
            let (tx, required) = contract.commit_tx_shape(false)?;
            Ok(required + tx_fee(rate, tx.vsize()))
        };

        let needed = required(self)?;
        if needed <= total {
            return Ok(Amount::ZERO);
        }
        let Some(addr) = addr else {
            return Ok(needed - total);
        };

        let source = Destination::from_addr_str(Amount::ZERO, addr, self.builder.network())?;
        let dust = source
            .script_pubkey()
            .map_or(Amount::ZERO, |script| self.builder.dust_floor(&script));
        let mut with_input = self.clone();
        with_input.inputs.push(TxInput::new(Utxo::new(Txid::all_zeros(), 0, source)));
        Ok((required(&with_input)? - total).max(dust))
    }

    pub fn raw_transactions(&self) -> Result<Vec<String>, ContractError> {
        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        Ok(vec![serialize_hex(&commit), serialize_hex(&genesis)])
    }

    pub fn transaction_count(&self, phase: InscriptionPhase) -> usize {
        match phase {
            InscriptionPhase::MarketTerms | InscriptionPhase::LazyInscriptionMarketTerms => 0,
            InscriptionPhase::LazyInscriptionSignature | InscriptionPhase::InscriptionSignature => 2,
        }
    }

    pub fn raw_transaction(&self, phase: InscriptionPhase, n: usize) -> Result<String, ContractError> {
        if n >= self.transaction_count(phase) {
            return Err(ContractError::State(format!("{} has no transaction {n}", phase.as_str())));
        }
        let commit = self.make_commit_tx()?;
        if n == 0 {
            Ok(serialize_hex(&commit))
        } else {
            Ok(serialize_hex(&self.make_genesis_tx(&commit)?))
        }
    }

    pub fn inscription_output(&self) -> Result<Utxo, ContractError> {
        let genesis = self.make_genesis_tx(&self.make_commit_tx()?)?;
        Ok(Utxo::new(genesis.compute_txid(), 0, state(&self.ord, NAME_ORD)?.clone()))
    }

    pub fn collection_output(&self) -> Result<Option<Utxo>, ContractError> {
        let Some(destination) = &self.collection_destination else {
            return Ok(None);
        };
        let genesis = self.make_genesis_tx(&self.make_commit_tx()?)?;
        Ok(Some(Utxo::new(genesis.compute_txid(), 1, destination.clone())))
    }

    pub fn fixed_change_output(&self) -> Result<Option<Utxo>, ContractError> {
        let Some(fixed_change) = &self.fixed_change else {
            return Ok(None);
        };
        let commit = self.make_commit_tx()?;
        let nout = if self.has_parent() { 2 } else { 1 };
        Ok(Some(Utxo::new(commit.compute_txid(), nout, fixed_change.clone())))
    }

    pub fn change_output(&self) -> Result<Option<Utxo>, ContractError> {
        let Some(change_addr) = self.builder.change_addr() else {
            return Ok(None);
        };
        let commit = self.make_commit_tx()?;
        let change_nout = 1 + usize::from(self.has_parent()) + usize::from(self.fixed_change.is_some());
        match commit.output.get(change_nout) {
            Some(out) => Ok(Some(Utxo::new(
                commit.compute_txid(),
                u32::try_from(change_nout).map_err(|e| ContractError::State(e.to_string()))?,
                Destination::from_address(out.value, change_addr.clone())?,
            ))),
            None => Ok(None),
        }
    }

    fn check_commit_sigs(&self) -> Result<(), ContractError> {
        let tx = self.make_commit_tx()?;
        let prevouts = self
            .inputs
            .iter()
            .map(|input| input.utxo.tx_out())
            .collect::<Result<Vec<_>, _>>()?;
        for nin in 0..tx.input.len() {
            verify_input(&tx, nin, &prevouts)
                .map_err(|e| ContractError::Signature(format!("{NAME_UTXO}[{nin}]")).caused_by(e))?;
        }
        Ok(())
    }

    fn check_author_sigs(&self) -> Result<(), ContractError> {
        let pk = state(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        let sig = state(&self.inscribe_sig, NAME_INSCRIBE_SIG)?;
        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        let spends = self.genesis_spends(&commit)?;
        let (script, _) = self.genesis_commitment()?;

        verify_taproot_signature(pk, sig, &genesis, GENESIS_NIN, &spends, Some(&script))
            .map_err(|e| ContractError::Signature(NAME_INSCRIBE_SIG.into()).caused_by(e))?;

        if self.has_parent() {
            let fund_sig = state(&self.fund_mining_fee_sig, NAME_FUND_MINING_FEE_SIG)?;
            let fund_script = if self.is_lazy() {
                Some(self.fund_mining_fee_commitment()?.0)
            } else {
                None
            };
            verify_taproot_signature(pk, fund_sig, &genesis, FUND_MINING_FEE_NIN, &spends, fund_script.as_deref())
                .map_err(|e| ContractError::Signature(NAME_FUND_MINING_FEE_SIG.into()).caused_by(e))?;
        }
        Ok(())
    }

    fn check_genesis_sigs(&self) -> Result<(), ContractError> {
        let commit = self.make_commit_tx()?;
        let genesis = self.make_genesis_tx(&commit)?;
        let spends = self.genesis_spends(&commit)?;
        for nin in 0..genesis.input.len() {
            verify_input(&genesis, nin, &spends)
                .map_err(|e| ContractError::Signature(format!("genesis input {nin}")).caused_by(e))?;
        }
        Ok(())
    }

    fn check_destination(dest: &Destination, version: u32, name: &str) -> Result<(), ContractError> {
        check_p2address(dest, version, LAST_NO_P2ADDRESS_VERSION, name)
    }
}

impl PhasedContract for InscriptionBuilder {
    type Phase = InscriptionPhase;
    type Params = InscriptionParams;

    const CONTRACT_TYPE: &'static str = "CreateInscription";
    const PROTOCOL_VERSION: u32 = 12;
    const SUPPORTED_VERSIONS: &'static [u32] = &[8, 9, 10, 11, 12];

    fn make_params(&self, version: u32, phase: InscriptionPhase) -> Result<InscriptionParams, ContractError> {
        use InscriptionPhase::*;
        let collection_terms = phase.reaches(LazyInscriptionMarketTerms);
        let author_terms = phase.reaches(LazyInscriptionSignature);
        let final_sigs = phase.reaches(InscriptionSignature);
        let legacy = version <= LAST_LEGACY_ORD_VERSION;

        let mut common = self.builder.make_params(author_terms, true, author_terms);
        if version <= LAST_NO_CUSTOM_FEE_VERSION {
            common.custom_fees.clear();
        }
        let ord = self.ord.as_ref().filter(|_| author_terms);

        Ok(InscriptionParams {
            common,
            inscription_type: Some(self.inscription_type),
            ord: ord.filter(|_| !legacy).map(Destination::to_repr),
            ord_amount: ord.filter(|_| legacy).map(Destination::amount),
            destination_addr: ord
                .filter(|_| legacy)
                .and_then(Destination::address)
                .map(ToString::to_string),
            utxo: if author_terms {
                self.inputs.iter().map(|input| input.to_repr(true)).collect()
            } else {
                Vec::new()
            },
            content_type: self.envelope.content_type.clone().filter(|_| author_terms),
            content: self.envelope.content.clone().filter(|_| author_terms),
            metadata: self.envelope.metadata.clone().filter(|_| author_terms),
            delegate: self
                .envelope
                .delegate
                .filter(|_| author_terms)
                .map(|id| id.to_string()),
            collection: self.envelope.parent.filter(|_| collection_terms).map(|id| CollectionRepr {
                collection_id: id.to_string(),
                utxo: self
                    .collection_input
                    .as_ref()
                    .map(|input| input.to_repr(final_sigs)),
            }),
            collection_destination: self
                .collection_destination
                .as_ref()
                .filter(|_| collection_terms && !legacy)
                .map(Destination::to_repr),
            inscribe_script_pk: self.inscribe_script_pk.filter(|_| author_terms),
            inscribe_int_pk: self.inscribe_int_pk.filter(|_| author_terms),
            inscribe_script_market_pk: self.inscribe_script_market_pk.filter(|_| collection_terms),
            fund_mining_fee_int_pk: self.fund_mining_fee_int_pk.filter(|_| author_terms),
            inscribe_sig: self.inscribe_sig.clone().filter(|_| author_terms),
            inscribe_market_sig: self.inscribe_market_sig.clone().filter(|_| final_sigs),
            fund_mining_fee_sig: self.fund_mining_fee_sig.clone().filter(|_| author_terms),
            fund_mining_fee_market_sig: self.fund_mining_fee_market_sig.clone().filter(|_| final_sigs),
            author_fee: self
                .author_fee
                .as_ref()
                .filter(|_| collection_terms)
                .map(Destination::to_repr),
            fixed_change: self
                .fixed_change
                .as_ref()
                .filter(|_| author_terms)
                .map(Destination::to_repr),
        })
    }

    fn merge_params(
        &mut self,
        params: InscriptionParams,
        version: u32,
        _phase: InscriptionPhase,
    ) -> Result<(), ContractError> {
        let network = self.builder.network();
        if let Some(inscription_type) = params.inscription_type {
            if inscription_type != self.inscription_type {
                return Err(ContractError::TermMismatch(NAME_INSCRIPTION_TYPE.into()));
            }
        }
        self.builder.merge_params(params.common)?;

        let ord = match (params.ord, params.ord_amount, params.destination_addr) {
            (Some(repr), _, _) => Some(read_destination(repr, network, NAME_ORD)?),
            (None, Some(amount), Some(addr)) => Some(
                Destination::from_addr_str(amount, &addr, network)
                    .map_err(|e| ContractError::TermWrongValue(NAME_DESTINATION_ADDR.into()).caused_by(e))?,
            ),
            (None, Some(_), None) => return Err(ContractError::TermMissing(NAME_DESTINATION_ADDR.into())),
            (None, None, Some(_)) => return Err(ContractError::TermMissing(NAME_ORD_AMOUNT.into())),
            (None, None, None) => None,
        };
        if let Some(ord) = &ord {
            if ord.is_zero() {
                return Err(ContractError::TermWrongValue(NAME_ORD.into()));
            }
            self.builder.check_dust(ord, NAME_ORD)?;
        }
        reconcile(&mut self.ord, ord, NAME_ORD)?;

        let inputs = params
            .utxo
            .into_iter()
            .enumerate()
            .map(|(i, repr)| read_input(repr, network, &format!("{NAME_UTXO}[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;
        reconcile_inputs(&mut self.inputs, inputs, NAME_UTXO)?;

        reconcile(&mut self.envelope.content_type, params.content_type, NAME_CONTENT_TYPE)?;
        reconcile(&mut self.envelope.content, params.content, NAME_CONTENT)?;
        reconcile(&mut self.envelope.metadata, params.metadata, NAME_METADATA)?;
        let delegate = params.delegate.map(|id| id.parse::<InscriptionId>()).transpose()?;
        reconcile(&mut self.envelope.delegate, delegate, NAME_DELEGATE)?;

        let mut legacy_collection_destination = None;
        if let Some(collection) = params.collection {
            let id: InscriptionId = collection.collection_id.parse()?;
            reconcile(&mut self.envelope.parent, Some(id), NAME_COLLECTION_ID)?;
            if let Some(repr) = collection.utxo {
                let input = read_input(repr, network, NAME_COLLECTION)?;
                legacy_collection_destination = Some(input.utxo.destination.clone());
                reconcile_input(&mut self.collection_input, input, NAME_COLLECTION)?;
            }
        }
        let collection_destination = match params.collection_destination {
            Some(repr) => Some(read_destination(repr, network, NAME_COLLECTION_DESTINATION)?),
            None if version <= LAST_LEGACY_ORD_VERSION => legacy_collection_destination,
            None => None,
        };
        reconcile(&mut self.collection_destination, collection_destination, NAME_COLLECTION_DESTINATION)?;

        reconcile(&mut self.inscribe_script_pk, params.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
        reconcile(&mut self.inscribe_int_pk, params.inscribe_int_pk, NAME_INSCRIBE_INT_PK)?;
        reconcile(
            &mut self.inscribe_script_market_pk,
            params.inscribe_script_market_pk,
            NAME_INSCRIBE_SCRIPT_MARKET_PK,
        )?;
        reconcile(&mut self.fund_mining_fee_int_pk, params.fund_mining_fee_int_pk, NAME_FUND_MINING_FEE_INT_PK)?;
        reconcile(&mut self.inscribe_sig, params.inscribe_sig, NAME_INSCRIBE_SIG)?;
        reconcile(&mut self.inscribe_market_sig, params.inscribe_market_sig, NAME_INSCRIBE_MARKET_SIG)?;
        reconcile(&mut self.fund_mining_fee_sig, params.fund_mining_fee_sig, NAME_FUND_MINING_FEE_SIG)?;
        reconcile(
            &mut self.fund_mining_fee_market_sig,
            params.fund_mining_fee_market_sig,
            NAME_FUND_MINING_FEE_MARKET_SIG,
        )?;

        let author_fee = params
            .author_fee
            .map(|repr| read_destination(repr, network, NAME_AUTHOR_FEE))
            .transpose()?;
        reconcile(&mut self.author_fee, author_fee, NAME_AUTHOR_FEE)?;
        let fixed_change = params
            .fixed_change
            .map(|repr| read_destination(repr, network, NAME_FIXED_CHANGE))
            .transpose()?;
        reconcile(&mut self.fixed_change, fixed_change, NAME_FIXED_CHANGE)
    }

    fn check_phase_terms(&self, version: u32, phase: InscriptionPhase) -> Result<(), ContractError> {
        match phase {
            InscriptionPhase::MarketTerms => {
                let market_fee = self
                    .builder
                    .market_fee()
                    .ok_or_else(|| ContractError::TermMissing(NAME_MARKET_FEE.into()))?;
                Self::check_destination(market_fee, version, NAME_MARKET_FEE)?;
                let custom_fees = self.builder.custom_fees();
                if !custom_fees.is_empty() && version <= LAST_NO_CUSTOM_FEE_VERSION {
                    return Err(ContractError::Protocol(format!(
                        "custom_fees is not supported with v. {version}"
                    )));
                }
                for (i, fee) in custom_fees.iter().enumerate() {
                    Self::check_destination(fee, version, &format!("custom_fees[{i}]"))?;
                }
                Ok(())
            }
            InscriptionPhase::LazyInscriptionMarketTerms => {
                if !self.is_lazy() {
                    return Ok(());
                }
                let author_fee = self
                    .author_fee
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_AUTHOR_FEE.into()))?;
                Self::check_destination(author_fee, version, NAME_AUTHOR_FEE)?;
                missing(&self.inscribe_script_market_pk, NAME_INSCRIBE_SCRIPT_MARKET_PK)?;
                missing(&self.envelope.parent, NAME_COLLECTION_ID)?;
                let collection = self
                    .collection_destination
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_COLLECTION_DESTINATION.into()))?;
                Self::check_destination(collection, version, NAME_COLLECTION_DESTINATION)?;
                if let Some(input) = &self.collection_input {
                    Self::check_destination(&input.utxo.destination, version, NAME_COLLECTION)?;
                }
                Ok(())
            }
            InscriptionPhase::LazyInscriptionSignature => {
                if self.envelope.content.is_some() {
                    missing(&self.envelope.content_type, NAME_CONTENT_TYPE)?;
                    if self.envelope.delegate.is_some() {
                        return Err(ContractError::TermMismatch(format!("{NAME_CONTENT} conflicts {NAME_DELEGATE}")));
                    }
                }
                let ord = self
                    .ord
                    .as_ref()
                    .ok_or_else(|| ContractError::TermMissing(NAME_ORD.into()))?;
                Self::check_destination(ord, version, NAME_ORD)?;
                missing(&self.builder.mining_fee_rate(), NAME_MINING_FEE_RATE)?;
                if self.inputs.is_empty() {
                    return Err(ContractError::TermMissing(NAME_UTXO.into()));
                }
                if let Some(i) = self.inputs.iter().position(|input| !input.witness.is_complete()) {
                    return Err(ContractError::TermMissing(format!("{NAME_UTXO}[{i}].witness")));
                }
                missing(&self.inscribe_script_pk, NAME_INSCRIBE_SCRIPT_PK)?;
                missing(&self.inscribe_int_pk, NAME_INSCRIBE_INT_PK)?;
                if self.is_lazy() {
                    missing(&self.fund_mining_fee_int_pk, NAME_FUND_MINING_FEE_INT_PK)?;
                }
                if let Some(change_addr) = self.builder.change_addr() {
                    let change = Destination::from_address(Amount::ZERO, change_addr.clone())?;
                    Self::check_destination(&change, version, NAME_CHANGE_ADDR)?;
                }
                if let Some(fixed_change) = &self.fixed_change {
                    if version <= LAST_NO_FIXED_CHANGE_VERSION {
                        return Err(ContractError::Protocol(format!(
                            "{NAME_FIXED_CHANGE} is not supported with v. {version}"
                        )));
                    }
                    Self::check_destination(fixed_change, version, NAME_FIXED_CHANGE)?;
                }
                missing(&self.inscribe_sig, NAME_INSCRIBE_SIG)?;
                if self.has_parent() {
                    missing(&self.fund_mining_fee_sig, NAME_FUND_MINING_FEE_SIG)?;
                }
                Ok(())
            }
            InscriptionPhase::InscriptionSignature => {
                if self.has_parent() {
                    missing(&self.collection_input, NAME_COLLECTION)?;
                }
                if let Some(collection) = &self.collection_input {
                    if !collection.witness.is_complete() {
                        return Err(ContractError::TermMissing(format!("{NAME_COLLECTION}.witness")));
                    }
                    missing(&self.envelope.parent, NAME_COLLECTION_ID)?;
                    let destination = self
                        .collection_destination
                        .as_ref()
                        .ok_or_else(|| ContractError::TermMissing(NAME_COLLECTION_DESTINATION.into()))?;
                    Self::check_destination(destination, version, NAME_COLLECTION_DESTINATION)?;
                }
                if self.is_lazy() {
                    missing(&self.inscribe_market_sig, NAME_INSCRIBE_MARKET_SIG)?;
                    if self.has_parent() {
                        missing(&self.fund_mining_fee_market_sig, NAME_FUND_MINING_FEE_MARKET_SIG)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn check_phase_signatures(&self, phase: InscriptionPhase) -> Result<(), ContractError> {
        match phase {
            InscriptionPhase::LazyInscriptionSignature => {
                self.check_commit_sigs()?;
                if self.is_lazy() || !self.has_parent() || self.collection_input.is_some() {
                    self.check_author_sigs()?;
                }
                Ok(())
            }
            InscriptionPhase::InscriptionSignature => self.check_genesis_sigs(),
            InscriptionPhase::MarketTerms | InscriptionPhase::LazyInscriptionMarketTerms => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use utxord_btc_types::{fee::paid_fee, ErrorKind};
    use utxord_test_utils::{fake_txid, p2tr_address, test_key_cache, TestKey};

    use super::*;

    const RATE: Amount = Amount::from_sat(3000);

    fn addr(key: TestKey) -> String {
        p2tr_address(key).to_string()
    }

    fn terms() -> InscriptionBuilder {
        let mut contract = InscriptionBuilder::new(Network::Regtest, InscriptionType::Inscription);
        contract.set_market_fee(Amount::from_sat(1000), &addr(TestKey::MarketFee)).expect("market fee");
        contract.set_mining_fee_rate(RATE).expect("rate");
        contract.set_ord_destination(Amount::from_sat(546), &addr(TestKey::Ord)).expect("ord");
        contract.set_data("text/plain", b"hello".to_vec()).expect("data");
        contract.set_inscribe_script_pk(TestKey::Inscribe.xonly()).expect("script pk");
        contract.set_inscribe_int_pk(TestKey::OrdInt.xonly()).expect("int pk");
        contract
    }

    #[test]
    fn test_change_takes_the_rest() {
        let mut contract = terms();
        contract.set_change_addr(&addr(TestKey::Change)).expect("change");
        let min = contract.get_min_funding_amount("change").expect("min funding");
        let funds = min + Amount::from_sat(10_000);
        contract.add_utxo(fake_txid(1), 0, funds, &addr(TestKey::Funds)).expect("utxo");

        let commit = contract.make_commit_tx().expect("commit");
        assert_eq!(commit.output.len(), 2);
        assert_eq!(commit.output[1].value, Amount::from_sat(10_000));
        assert_eq!(paid_fee(funds, &commit), Some(tx_fee(RATE, commit.vsize())));

        let genesis = contract.make_genesis_tx(&commit).expect("genesis");
        assert_eq!(
            paid_fee(commit.output[0].value, &genesis),
            Some(tx_fee(RATE, genesis.vsize())),
            "genesis template has the final size"
        );
        assert_eq!(contract.change_output().expect("change").map(|u| u.amount()), Some(Amount::from_sat(10_000)));
    }

    #[test]
    fn test_dust_change_goes_to_the_inscription() {
        let mut contract = terms();
        contract.set_change_addr(&addr(TestKey::Change)).expect("change");
        let min = contract.get_min_funding_amount("").expect("min funding");
        contract
            .add_utxo(fake_txid(1), 0, min + Amount::from_sat(100), &addr(TestKey::Funds))
            .expect("utxo");

        let commit = contract.make_commit_tx().expect("commit");
        assert_eq!(commit.output.len(), 1);
        assert_eq!(contract.change_output().expect("change"), None);
        let genesis = contract.make_genesis_tx(&commit).expect("genesis");
        assert_eq!(genesis.output[0].value, Amount::from_sat(546));
        assert_eq!(genesis.output[1].value, Amount::from_sat(1000));
    }

    #[test]
    fn test_missing_amount() {
        let mut contract = terms();
        contract.add_utxo(fake_txid(1), 0, Amount::from_sat(1000), &addr(TestKey::Funds)).expect("utxo");
        let missing = contract.calculate_missing_amount(None).expect("missing");
        let with_input = contract
            .calculate_missing_amount(Some(&addr(TestKey::Funds)))
            .expect("missing with input");
        assert_eq!(with_input - missing, tx_fee(RATE, TAPROOT_KEYSPEND_VIN_VSIZE));

        let mut funded = contract.clone();
        funded.add_utxo(fake_txid(2), 0, with_input, &addr(TestKey::Funds)).expect("utxo");
        assert_eq!(funded.calculate_missing_amount(None), Ok(Amount::ZERO));
        funded.make_commit_tx().expect("enough funds");
    }

    #[test]
    fn test_sign_and_verify() {
        let cache = test_key_cache();
        let mut contract = terms();
        let min = contract.get_min_funding_amount("").expect("min funding");
        contract.add_utxo(fake_txid(1), 0, min, &addr(TestKey::Funds)).expect("utxo");

        contract.sign_commit(&cache, "").expect("commit");
        contract.sign_inscription(&cache, TestKey::Inscribe.tag()).expect("inscription");
        contract
            .check_contract_terms(12, InscriptionPhase::InscriptionSignature)
            .expect("complete contract");

        let id = contract.make_inscription_id().expect("id");
        let genesis = contract.make_genesis_tx(&contract.make_commit_tx().expect("commit")).expect("genesis");
        assert_eq!(id, format!("{}i0", genesis.compute_txid()));
        assert_eq!(contract.raw_transactions().expect("raw").len(), 2);
    }

    #[test]
    fn test_version_gates() {
        let mut contract = terms();
        contract.add_custom_fee(Amount::from_sat(1000), &addr(TestKey::Custom)).expect("custom fee");
        assert_eq!(
            contract.check_phase_terms(10, InscriptionPhase::MarketTerms).map_err(|e| e.kind()),
            Err(ErrorKind::Protocol)
        );
        contract.check_phase_terms(11, InscriptionPhase::MarketTerms).expect("v11 has custom fees");

        contract.set_fixed_change(Amount::from_sat(1000), &addr(TestKey::Change)).expect("fixed change");
        let params = contract.make_params(8, InscriptionPhase::LazyInscriptionSignature).expect("params");
        assert_eq!(params.ord, None);
        assert_eq!(params.ord_amount, Some(Amount::from_sat(546)));
        assert!(params.common.custom_fees.is_empty());
    }

    #[test]
    fn test_lazy_requires_collection() {
        let mut contract = InscriptionBuilder::new(Network::Regtest, InscriptionType::LazyInscription);
        contract.set_inscribe_int_pk(TestKey::OrdInt.xonly()).expect("int pk");
        contract.set_inscribe_script_pk(TestKey::Inscribe.xonly()).expect("script pk");
        contract.set_inscribe_script_market_pk(TestKey::MarketScript.xonly()).expect("market pk");
        assert_eq!(contract.genesis_commitment().map(|_| ()).map_err(|e| e.kind()), Err(ErrorKind::State));
    }
}
