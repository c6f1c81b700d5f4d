//! Attended/absent partition of the registered identities for a day.

use crate::ledger::{AttendanceLedger, LedgerError};
use crate::store::TemplateStore;
use crate::types::IdentityLabel;
use chrono::{Local, NaiveDate};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub date: NaiveDate,
    /// Distinct identities with at least one ledger row on `date`. May
    /// include identities that were never enrolled.
    pub attended: BTreeSet<IdentityLabel>,
    /// Enrolled identities without a ledger row on `date`.
    pub absent: BTreeSet<IdentityLabel>,
}

/// Derives rosters on demand; nothing is cached.
pub struct RosterService {
    store: Arc<TemplateStore>,
    ledger: Arc<AttendanceLedger>,
}

impl RosterService {
    pub fn new(store: Arc<TemplateStore>, ledger: Arc<AttendanceLedger>) -> Self {
        Self { store, ledger }
    }

    pub fn today(&self) -> Result<Roster, LedgerError> {
        self.for_date(Local::now().date_naive())
    }

    pub fn for_date(&self, date: NaiveDate) -> Result<Roster, LedgerError> {
        let attended = self
            .ledger
            .records_for_date(date)?
            .map(|record| record.map(|r| r.label()))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let gallery = self.store.snapshot();
        let absent = gallery
            .labels()
            .filter(|label| !attended.contains(*label))
            .cloned()
            .collect();

        Ok(Roster {
            date,
            attended,
            absent,
        })
    }
}
