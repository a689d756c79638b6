use std::fmt;

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// A required resource that cannot cover a candidate window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceShortfall {
    pub resource_id: Ulid,
    pub resource_name: String,
    pub needed: u32,
    pub available: u32,
}

impl fmt::Display for ResourceShortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource {} needs {}, available {}",
            self.resource_name, self.needed, self.available
        )
    }
}

/// Check each requirement independently against the committed units of every
/// overlapping live slot on `date`, ignoring `exclude_slot`. Returns the first
/// resource that falls short. Reserves nothing.
pub(crate) fn find_shortfall<'a>(
    requirements: &[ResourceRequirement],
    catalog: &DashMap<Ulid, Resource>,
    ledger_of: impl Fn(&Ulid) -> Option<&'a ResourceLedger>,
    date: NaiveDate,
    window: &TimeWindow,
    exclude_slot: Option<Ulid>,
) -> Result<Option<ResourceShortfall>, EngineError> {
    for req in requirements {
        let resource = catalog
            .get(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        let used = ledger_of(&req.resource_id)
            .map(|l| l.used(date, window, exclude_slot))
            .unwrap_or(0);
        let available = resource.total_quantity.saturating_sub(used);
        if req.quantity_needed > available {
            return Ok(Some(ResourceShortfall {
                resource_id: req.resource_id,
                resource_name: resource.name.clone(),
                needed: req.quantity_needed,
                available,
            }));
        }
    }
    Ok(None)
}

/// `date time: reason`, the per-slot message recorded by generation.
pub(crate) fn conflict_message(date: NaiveDate, window: &TimeWindow, reason: impl fmt::Display) -> String {
    format!("{} {}: {}", date, window.start.format("%H:%M"), reason)
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

pub(crate) fn validate_customer(customer: &CustomerIdentity) -> Result<(), EngineError> {
    match customer {
        CustomerIdentity::Registered { user_id } => validate_name(user_id, "customer id"),
        CustomerIdentity::Guest { name, phone, email } => {
            validate_name(name, "customer name")?;
            validate_name(phone, "customer phone")?;
            if let Some(email) = email {
                if email.len() > MAX_NAME_LEN {
                    return Err(EngineError::LimitExceeded("email too long"));
                }
                if !email.contains('@') {
                    return Err(EngineError::Validation(format!("invalid email: {email}")));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn setup(total: u32) -> (DashMap<Ulid, Resource>, ResourceLedger, Ulid) {
        let rid = Ulid::new();
        let catalog = DashMap::new();
        catalog.insert(
            rid,
            Resource {
                id: rid,
                name: "Jeep".into(),
                total_quantity: total,
                seats_per_unit: 4,
            },
        );
        (catalog, ResourceLedger::new(rid), rid)
    }

    fn commit(ledger: &mut ResourceLedger, date: NaiveDate, window: TimeWindow, q: u32) -> Ulid {
        let slot_id = Ulid::new();
        ledger.insert(LedgerEntry {
            slot_id,
            date,
            window,
            quantity: q,
        });
        slot_id
    }

    #[test]
    fn adjacent_window_does_not_conflict() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let (catalog, mut ledger, rid) = setup(1);
        commit(&mut ledger, date, TimeWindow::new(t(9, 0), t(10, 0)), 1);
        let reqs = [ResourceRequirement {
            resource_id: rid,
            quantity_needed: 1,
        }];

        let at_ten = TimeWindow::new(t(10, 0), t(11, 0));
        let r = find_shortfall(&reqs, &catalog, |_| Some(&ledger), date, &at_ten, None).unwrap();
        assert!(r.is_none());

        let at_nine_59 = TimeWindow::new(t(9, 59), t(11, 0));
        let r = find_shortfall(&reqs, &catalog, |_| Some(&ledger), date, &at_nine_59, None).unwrap();
        let shortfall = r.unwrap();
        assert_eq!(shortfall.available, 0);
        assert_eq!(shortfall.to_string(), "resource Jeep needs 1, available 0");
    }

    #[test]
    fn excluded_slot_is_ignored() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let (catalog, mut ledger, rid) = setup(2);
        let window = TimeWindow::new(t(9, 0), t(10, 0));
        let existing = commit(&mut ledger, date, window, 2);
        let reqs = [ResourceRequirement {
            resource_id: rid,
            quantity_needed: 2,
        }];
        let r = find_shortfall(&reqs, &catalog, |_| Some(&ledger), date, &window, None).unwrap();
        assert!(r.is_some());
        let r = find_shortfall(&reqs, &catalog, |_| Some(&ledger), date, &window, Some(existing))
            .unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn unknown_resource_is_not_found() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let (catalog, _, _) = setup(2);
        let reqs = [ResourceRequirement {
            resource_id: Ulid::new(),
            quantity_needed: 1,
        }];
        let window = TimeWindow::new(t(9, 0), t(10, 0));
        let r = find_shortfall(&reqs, &catalog, |_| None, date, &window, None);
        assert!(matches!(r, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn conflict_message_format() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let window = TimeWindow::new(t(9, 0), t(10, 0));
        assert_eq!(
            conflict_message(date, &window, "resource Jeep needs 1, available 0"),
            "2025-06-02 09:00: resource Jeep needs 1, available 0"
        );
    }

    #[test]
    fn guest_contact_validation() {
        let ok = CustomerIdentity::Guest {
            name: "Ann".into(),
            phone: "+4915".into(),
            email: Some("ann@example.com".into()),
        };
        assert!(validate_customer(&ok).is_ok());
        let missing_phone = CustomerIdentity::Guest {
            name: "Ann".into(),
            phone: " ".into(),
            email: None,
        };
        assert!(matches!(
            validate_customer(&missing_phone),
            Err(EngineError::Validation(_))
        ));
        let bad_email = CustomerIdentity::Guest {
            name: "Ann".into(),
            phone: "1".into(),
            email: Some("nope".into()),
        };
        assert!(validate_customer(&bad_email).is_err());
    }
}
