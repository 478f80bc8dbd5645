// 📥 CSV import of account records
//
// Expected header: account_nr,balance (balance optional, defaults to 0)

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

use crate::entities::Account;
use crate::error::Result;

/// One row of an account import file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountRecord {
    pub account_nr: i64,

    #[serde(default)]
    pub balance: i64,
}

impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Account::new(record.account_nr).with_balance(record.balance)
    }
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<AccountRecord>> {
    let rdr = csv::Reader::from_path(csv_path)?;
    read_records(rdr)
}

pub fn parse_csv<R: Read>(reader: R) -> Result<Vec<AccountRecord>> {
    read_records(csv::Reader::from_reader(reader))
}

fn read_records<R: Read>(mut rdr: csv::Reader<R>) -> Result<Vec<AccountRecord>> {
    let mut records = Vec::new();

    for result in rdr.deserialize() {
        let record: AccountRecord = result?;
        records.push(record);
    }

    tracing::debug!(records = records.len(), "account csv parsed");
    Ok(records)
}
