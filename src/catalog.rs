// ===============================
// src/catalog.rs (contract catalog)
// ===============================
//
// One row per tradable instrument, comma separated:
//   root, sec_type, exchange, local_symbol, min_tick, commission_per_contract,
//   multiplier, chillness, num_contracts, currency
//
// Example:
//   MES,FUT,GLOBEX,MESH0,.25,.47,5,0,1,USD
//
// Text fields are trimmed and uppercased. Blank lines and `#` comments are skipped.
//
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ahash::AHashSet as HashSet;
use thiserror::Error;

use crate::domain::{Contract, Symbol};

const COLUMNS: usize = 10;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not open symbol information file {}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("line {line}: expected 10 columns, found {found}")]
    Columns { line: usize, found: usize },
    #[error("line {line}: field `{field}` has invalid value {value:?}")]
    Number { line: usize, field: &'static str, value: String },
    #[error("line {line}: local symbol {symbol} listed twice")]
    Duplicate { line: usize, symbol: Symbol },
    #[error("catalog has no instruments")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractSpec {
    pub root: String,
    pub sec_type: String,
    pub exchange: String,
    pub local_symbol: Symbol,
    pub min_tick: f64,
    pub commission_per_contract: f64,
    pub multiplier: u32,
    /// risk-scaling knob, carried through untouched
    pub chillness: u32,
    pub num_contracts: u32,
    pub currency: String,
}

impl ContractSpec {
    pub fn contract(&self) -> Contract {
        Contract {
            symbol: self.root.clone(),
            local_symbol: self.local_symbol.clone(),
            sec_type: self.sec_type.clone(),
            currency: self.currency.clone(),
            exchange: self.exchange.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    contracts: Vec<ContractSpec>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CatalogError::Io { path: path.to_path_buf(), source })?;
        Self::parse(BufReader::new(file), path)
    }

    pub fn parse(reader: impl BufRead, origin: &Path) -> Result<Self, CatalogError> {
        let mut contracts = Vec::new();
        let mut seen = HashSet::new();

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|source| CatalogError::Io { path: origin.to_path_buf(), source })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let spec = parse_row(trimmed, line_no)?;
            if !seen.insert(spec.local_symbol.clone()) {
                return Err(CatalogError::Duplicate { line: line_no, symbol: spec.local_symbol });
            }
            contracts.push(spec);
        }

        if contracts.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { contracts })
    }

    pub fn len(&self) -> usize { self.contracts.len() }
    pub fn is_empty(&self) -> bool { self.contracts.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &ContractSpec> { self.contracts.iter() }
}

fn parse_row(line: &str, line_no: usize) -> Result<ContractSpec, CatalogError> {
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    if cols.len() != COLUMNS {
        return Err(CatalogError::Columns { line: line_no, found: cols.len() });
    }

    Ok(ContractSpec {
        root: cols[0].to_ascii_uppercase(),
        sec_type: cols[1].to_ascii_uppercase(),
        exchange: cols[2].to_ascii_uppercase(),
        local_symbol: Symbol::new(cols[3]),
        min_tick: number(cols[4], "min_tick", line_no)?,
        commission_per_contract: number(cols[5], "commission_per_contract", line_no)?,
        multiplier: number(cols[6], "multiplier", line_no)?,
        chillness: number(cols[7], "chillness", line_no)?,
        num_contracts: number(cols[8], "num_contracts", line_no)?,
        currency: cols[9].to_ascii_uppercase(),
    })
}

fn number<T: FromStr>(raw: &str, field: &'static str, line: usize) -> Result<T, CatalogError> {
    raw.parse().map_err(|_| CatalogError::Number { line, field, value: raw.to_string() })
}

#[cfg(test)]
pub(crate) fn test_catalog(rows: &str) -> Catalog {
    Catalog::parse(rows.as_bytes(), Path::new("<test>")).unwrap()
}
