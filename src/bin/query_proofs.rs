//! Dump stored capsules for a symbol whose drift falls inside a range.
//!
//! usage: query_proofs <db> <symbol> [lo] [hi]
//!        query_proofs <db> <symbol> --latest [n]

use anyhow::{bail, Context, Result};

use entropylab::storage::CapsuleStore;

fn parse_f64(raw: Option<String>, default: f64) -> Result<f64> {
    match raw {
        Some(v) => v.parse::<f64>().with_context(|| format!("bad bound {:?}", v)),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (db, symbol) = match (args.next(), args.next()) {
        (Some(db), Some(symbol)) => (db, symbol),
        _ => bail!("usage: query_proofs <db> <symbol> [lo] [hi] | --latest [n]"),
    };
    let store = CapsuleStore::open(&db).with_context(|| format!("opening {}", db))?;

    let third = args.next();
    let records = if third.as_deref() == Some("--latest") {
        let limit = match args.next() {
            Some(v) => v.parse::<usize>().with_context(|| format!("bad limit {:?}", v))?,
            None => 10,
        };
        store.latest(&symbol, limit)?
    } else {
        let lo = parse_f64(third, 0.0)?;
        let hi = parse_f64(args.next(), 1.0)?;
        store.query(&symbol, lo, hi)?
    };

    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    eprintln!("{} capsules ({} stored for {})", records.len(), store.count(&symbol)?, symbol);
    Ok(())
}
