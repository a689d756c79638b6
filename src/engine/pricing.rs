use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Price and resource manifest for `participants` on `tour`.
///
/// `total = base_price × participants`, rounded to cents. The manifest is
/// informational: per requirement, `ceil(participants / seats_per_unit)` units
/// capped at the configured quantity. Resources never affect the price.
pub fn price_quote(
    tour: &Tour,
    participants: u32,
    resource: impl Fn(&Ulid) -> Option<Resource>,
) -> Result<PriceQuote, EngineError> {
    if participants == 0 {
        return Err(EngineError::Validation(
            "participants must be at least 1".into(),
        ));
    }
    let total_price = (tour.base_price * Decimal::from(participants)).round_dp(2);

    let mut manifest = Vec::with_capacity(tour.requirements.len());
    for req in &tour.requirements {
        let r = resource(&req.resource_id).ok_or(EngineError::NotFound(req.resource_id))?;
        // A unit always seats at least one person.
        let seats_per_unit = r.seats_per_unit.max(1);
        let units_needed = participants.div_ceil(seats_per_unit).min(req.quantity_needed);
        manifest.push(ManifestLine {
            resource_id: r.id,
            resource_name: r.name,
            units_needed,
            seats_per_unit,
            capacity: units_needed * seats_per_unit,
            quantity_available: r.total_quantity,
        });
    }

    Ok(PriceQuote {
        total_price,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tour(base: i64, reqs: Vec<ResourceRequirement>) -> Tour {
        Tour {
            id: Ulid::new(),
            base_price: Decimal::from(base),
            min_participants: 1,
            max_participants: Some(12),
            requirements: reqs,
        }
    }

    #[test]
    fn price_is_base_times_participants() {
        let q = price_quote(&tour(2000, vec![]), 3, |_| None).unwrap();
        assert_eq!(q.total_price, Decimal::from(6000));
        assert!(q.manifest.is_empty());
    }

    #[test]
    fn fractional_prices_keep_cents() {
        let mut t = tour(0, vec![]);
        t.base_price = "19.99".parse().unwrap();
        let q = price_quote(&t, 3, |_| None).unwrap();
        assert_eq!(q.total_price, "59.97".parse::<Decimal>().unwrap());
    }

    #[test]
    fn manifest_rounds_up_and_caps() {
        let jeep = Resource {
            id: Ulid::new(),
            name: "Jeep".into(),
            total_quantity: 5,
            seats_per_unit: 4,
        };
        let guide = Resource {
            id: Ulid::new(),
            name: "Guide".into(),
            total_quantity: 3,
            seats_per_unit: 100,
        };
        let catalog: HashMap<Ulid, Resource> =
            [(jeep.id, jeep.clone()), (guide.id, guide.clone())].into();
        let t = tour(
            2000,
            vec![
                ResourceRequirement {
                    resource_id: jeep.id,
                    quantity_needed: 2,
                },
                ResourceRequirement {
                    resource_id: guide.id,
                    quantity_needed: 1,
                },
            ],
        );

        let q = price_quote(&t, 5, |id| catalog.get(id).cloned()).unwrap();
        assert_eq!(q.total_price, Decimal::from(10_000));
        assert_eq!(q.manifest[0].units_needed, 2);
        assert_eq!(q.manifest[0].capacity, 8);
        assert_eq!(q.manifest[1].units_needed, 1);

        // 11 people would need 3 jeeps, capped at the requirement of 2.
        let q = price_quote(&t, 11, |id| catalog.get(id).cloned()).unwrap();
        assert_eq!(q.manifest[0].units_needed, 2);
        assert_eq!(q.manifest[0].quantity_available, 5);
        // Price ignores the manifest.
        assert_eq!(q.total_price, Decimal::from(22_000));
    }

    #[test]
    fn seatless_resource_counts_one_seat_per_unit() {
        let kayak = Resource {
            id: Ulid::new(),
            name: "Kayak".into(),
            total_quantity: 10,
            seats_per_unit: 0,
        };
        let t = tour(
            30,
            vec![ResourceRequirement {
                resource_id: kayak.id,
                quantity_needed: 4,
            }],
        );
        let q = price_quote(&t, 3, |_| Some(kayak.clone())).unwrap();
        assert_eq!(q.manifest[0].units_needed, 3);
        assert_eq!(q.manifest[0].seats_per_unit, 1);
        assert_eq!(q.manifest[0].capacity, 3);
    }

    #[test]
    fn zero_participants_rejected() {
        assert!(matches!(
            price_quote(&tour(10, vec![]), 0, |_| None),
            Err(EngineError::Validation(_))
        ));
    }
}
