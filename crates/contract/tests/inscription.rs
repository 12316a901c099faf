//! Inscription creation exchanged between author and market: plain, child of a collection and
//! lazy with the market attaching the collection after the author has signed.

use bitcoin::{consensus::encode::deserialize_hex, Amount, Network, Transaction, TxOut};
use utxord_btc_types::{
    fee::{paid_fee, tx_fee},
    verify_input, ErrorKind,
};
use utxord_contract::{
    inscription::InscriptionId, InscriptionBuilder, InscriptionPhase, InscriptionType, PhasedContract,
};
use utxord_test_utils::{fake_txid, init_test_logging, p2tr_address, test_key_cache, TestKey};

const VERSION: u32 = 12;
const RATE: Amount = Amount::from_sat(2000);

fn addr(key: TestKey) -> String {
    p2tr_address(key).to_string()
}

fn tx(hex: &str) -> Transaction {
    deserialize_hex(hex).expect("consensus encoded transaction")
}

fn collection_id() -> String {
    InscriptionId::new(fake_txid(8), 0).to_string()
}

fn market_terms(inscription_type: InscriptionType) -> InscriptionBuilder {
    let mut market = InscriptionBuilder::new(Network::Regtest, inscription_type);
    market
        .set_market_fee(Amount::from_sat(1000), &addr(TestKey::MarketFee))
        .expect("market fee");
    market
}

/// Author side up to the signed commit and genesis.
fn author_signs(author: &mut InscriptionBuilder, with_collection_utxo: bool) {
    let cache = test_key_cache();
    author.set_mining_fee_rate(RATE).expect("rate");
    author
        .set_ord_destination(Amount::from_sat(546), &addr(TestKey::Ord))
        .expect("ord");
    author
        .set_data("text/plain;charset=utf-8", b"utxord".to_vec())
        .expect("content");
    author.set_inscribe_script_pk(TestKey::Inscribe.xonly()).expect("script pk");
    author.set_inscribe_int_pk(TestKey::OrdInt.xonly()).expect("internal pk");
    if author.inscription_type() == InscriptionType::LazyInscription {
        author
            .set_fund_mining_fee_int_pk(TestKey::OrdFunding.xonly())
            .expect("fund internal pk");
    }
    if with_collection_utxo {
        author
            .add_collection_utxo(fake_txid(9), 0, Amount::from_sat(546), &addr(TestKey::Collection))
            .expect("collection utxo");
    }

    let funding = author.get_min_funding_amount("").expect("min funding");
    author
        .add_utxo(fake_txid(1), 0, funding, &addr(TestKey::Funds))
        .expect("utxo");
    author.sign_commit(&cache, "").expect("commit signed");
    author.sign_inscription(&cache, "").expect("genesis signed");
}

fn assert_genesis_verifies(contract: &InscriptionBuilder) -> (Transaction, Transaction) {
    let commit = tx(&contract.raw_transaction(InscriptionPhase::InscriptionSignature, 0).expect("commit"));
    let genesis = tx(&contract.raw_transaction(InscriptionPhase::InscriptionSignature, 1).expect("genesis"));

    let mut spends = vec![commit.output[0].clone()];
    if genesis.input.len() > 1 {
        spends.push(TxOut {
            value: Amount::from_sat(546),
            script_pubkey: p2tr_address(TestKey::Collection).script_pubkey(),
        });
        spends.push(commit.output[1].clone());
    }
    for nin in 0..genesis.input.len() {
        verify_input(&genesis, nin, &spends).unwrap_or_else(|e| panic!("genesis input {nin}: {e}"));
    }

    let spent: Amount = spends.iter().map(|out| out.value).sum();
    let fee = paid_fee(spent, &genesis).expect("outputs covered");
    assert!(fee >= tx_fee(RATE, genesis.vsize()), "{fee} for {} vB", genesis.vsize());
    (commit, genesis)
}

#[test]
fn test_plain_inscription() {
    init_test_logging();
    let market_json = market_terms(InscriptionType::Inscription)
        .serialize(VERSION, InscriptionPhase::MarketTerms)
        .expect("market terms");

    let mut author = InscriptionBuilder::new(Network::Regtest, InscriptionType::Inscription);
    author
        .deserialize(&market_json, InscriptionPhase::MarketTerms)
        .expect("author takes the terms");
    author_signs(&mut author, false);
    let signed = author
        .serialize(VERSION, InscriptionPhase::InscriptionSignature)
        .expect("author snapshot");

    let mut market = market_terms(InscriptionType::Inscription);
    market
        .deserialize(&signed, InscriptionPhase::InscriptionSignature)
        .expect("market takes the signed inscription");

    let (commit, genesis) = assert_genesis_verifies(&market);
    assert_eq!(genesis.output[0].value, Amount::from_sat(546));
    assert_eq!(genesis.output[1].value, Amount::from_sat(1000));
    assert_eq!(
        paid_fee(commit.output[0].value, &genesis),
        Some(tx_fee(RATE, genesis.vsize())),
        "without a collection the genesis fee is exact"
    );
    assert_eq!(
        market.make_inscription_id().expect("id"),
        format!("{}i0", genesis.compute_txid())
    );
    assert_eq!(market.make_inscription_id(), author.make_inscription_id());
}

#[test]
fn test_snapshot_round_trip_and_idempotence() {
    let mut author = market_terms(InscriptionType::Inscription);
    author_signs(&mut author, false);
    let signed = author
        .serialize(VERSION, InscriptionPhase::InscriptionSignature)
        .expect("snapshot");

    let mut other = InscriptionBuilder::new(Network::Regtest, InscriptionType::Inscription);
    other
        .deserialize(&signed, InscriptionPhase::InscriptionSignature)
        .expect("fresh copy");
    assert_eq!(
        other.serialize(VERSION, InscriptionPhase::InscriptionSignature).expect("again"),
        signed
    );

    let before = other.clone();
    other
        .deserialize(&signed, InscriptionPhase::InscriptionSignature)
        .expect("same snapshot twice");
    assert_eq!(other, before);

    let mut json: serde_json::Value = serde_json::from_str(&signed).expect("json");
    json["params"]["ord"]["amount"] = 600.into();
    let err = other
        .deserialize(&json.to_string(), InscriptionPhase::InscriptionSignature)
        .expect_err("different ord amount");
    assert_eq!(err.kind(), ErrorKind::TermMismatch);
    assert_eq!(other, before);
}

#[test]
fn test_legacy_version_round_trip() {
    let mut author = market_terms(InscriptionType::Inscription);
    author_signs(&mut author, false);
    let legacy = author
        .serialize(9, InscriptionPhase::InscriptionSignature)
        .expect("v9 snapshot");
    let json: serde_json::Value = serde_json::from_str(&legacy).expect("json");
    assert_eq!(json["params"]["ord_amount"], 546);
    assert!(json["params"].get("ord").is_none());

    let mut other = InscriptionBuilder::new(Network::Regtest, InscriptionType::Inscription);
    other
        .deserialize(&legacy, InscriptionPhase::InscriptionSignature)
        .expect("v9 is supported");
    assert_eq!(other.make_inscription_id(), author.make_inscription_id());

    assert_eq!(
        author
            .serialize(7, InscriptionPhase::InscriptionSignature)
            .map_err(|e| e.kind()),
        Err(ErrorKind::Protocol)
    );
}

#[test]
fn test_child_of_collection() {
    let cache = test_key_cache();
    let mut author = market_terms(InscriptionType::Inscription);
    author
        .set_collection(&collection_id(), Amount::from_sat(546), &addr(TestKey::Collection))
        .expect("collection");
    author_signs(&mut author, true);
    author.sign_collection(&cache, "").expect("collection signed");

    let signed = author
        .serialize(VERSION, InscriptionPhase::InscriptionSignature)
        .expect("author snapshot");
    let mut market = market_terms(InscriptionType::Inscription);
    market
        .deserialize(&signed, InscriptionPhase::InscriptionSignature)
        .expect("market takes the signed inscription");

    let (commit, genesis) = assert_genesis_verifies(&market);
    assert_eq!(commit.output.len(), 2);
    assert_eq!(genesis.input[2].previous_output.vout, 1);
    let amounts: Vec<u64> = genesis.output.iter().map(|out| out.value.to_sat()).collect();
    assert_eq!(amounts, vec![546, 546, 1000]);

    let collection = market.collection_output().expect("collection output").expect("child");
    assert_eq!(collection.txid, genesis.compute_txid());
    assert_eq!(collection.nout, 1);
}

#[test]
fn test_lazy_inscription() {
    init_test_logging();
    let cache = test_key_cache();

    let mut market = market_terms(InscriptionType::LazyInscription);
    market
        .set_collection(&collection_id(), Amount::from_sat(546), &addr(TestKey::Collection))
        .expect("collection");
    market
        .set_inscribe_script_market_pk(TestKey::MarketScript.xonly())
        .expect("market pk");
    market
        .set_author_fee(Amount::from_sat(700), &addr(TestKey::Author))
        .expect("author fee");
    let terms = market
        .serialize(VERSION, InscriptionPhase::LazyInscriptionMarketTerms)
        .expect("lazy terms");

    let mut author = InscriptionBuilder::new(Network::Regtest, InscriptionType::LazyInscription);
    author
        .deserialize(&terms, InscriptionPhase::LazyInscriptionMarketTerms)
        .expect("author takes the terms");
    author_signs(&mut author, false);
    let author_sig = author
        .serialize(VERSION, InscriptionPhase::LazyInscriptionSignature)
        .expect("author snapshot");
    assert_eq!(
        author
            .serialize(VERSION, InscriptionPhase::InscriptionSignature)
            .map_err(|e| e.kind()),
        Err(ErrorKind::TermMissing),
        "the collection is still missing"
    );

    market
        .deserialize(&author_sig, InscriptionPhase::LazyInscriptionSignature)
        .expect("market takes the author signature");
    market
        .add_collection_utxo(fake_txid(9), 0, Amount::from_sat(546), &addr(TestKey::Collection))
        .expect("collection utxo");
    market.sign_collection(&cache, "").expect("collection signed");
    market
        .market_sign_inscription(&cache, TestKey::MarketScript.tag())
        .expect("market co-signs");
    let complete = market
        .serialize(VERSION, InscriptionPhase::InscriptionSignature)
        .expect("final snapshot");

    let (_, genesis) = assert_genesis_verifies(&market);
    let amounts: Vec<u64> = genesis.output.iter().map(|out| out.value.to_sat()).collect();
    assert_eq!(amounts, vec![546, 546, 1000, 700]);

    author
        .deserialize(&complete, InscriptionPhase::InscriptionSignature)
        .expect("author takes the final snapshot");
    assert_eq!(author.make_inscription_id(), market.make_inscription_id());
}
