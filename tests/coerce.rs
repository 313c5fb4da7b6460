use chrono::{NaiveDate, Timelike};
use proptest::prelude::*;
use report_ingest::coerce::{coerce_float, coerce_integer, coerce_value, serial_to_datetime};
use report_ingest::schema::FieldType;
use report_ingest::value::Value;

#[test]
fn integer_examples() {
    assert_eq!(coerce_integer("1,234").unwrap(), Value::Int64(1234));
    assert_eq!(coerce_integer("").unwrap(), Value::Null);
    assert!(coerce_integer("abc").is_err());
    assert_eq!(coerce_integer("3.9").unwrap(), Value::Int64(3));
}

#[test]
fn serial_date_example_within_one_second() {
    let parsed = serial_to_datetime(45737.99779).expect("in range");
    let expected = NaiveDate::from_ymd_opt(2025, 3, 21)
        .unwrap()
        .and_hms_opt(23, 56, 49)
        .unwrap();
    assert!((parsed - expected).num_seconds().abs() <= 1);
}

#[test]
fn japanese_date_example() {
    assert_eq!(
        coerce_value("2023年4月1日", FieldType::Date).unwrap(),
        Value::Date(NaiveDate::from_ymd_opt(2023, 4, 1).unwrap())
    );
    assert_eq!(
        coerce_value("2023年4月1日", FieldType::Timestamp).unwrap(),
        Value::Timestamp(NaiveDate::from_ymd_opt(2023, 4, 1).unwrap().and_hms_opt(0, 0, 0).unwrap())
    );
}

fn with_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

proptest! {
    #[test]
    fn grouped_integers_round_trip(value in any::<i64>()) {
        prop_assert_eq!(coerce_integer(&with_thousands(value)).unwrap(), Value::Int64(value));
    }

    #[test]
    fn fractions_truncate_toward_zero(whole in -1_000_000i64..1_000_000, frac in 1u32..1000) {
        let text = format!("{whole}.{frac:03}");
        let expected = text.parse::<f64>().unwrap().trunc() as i64;
        prop_assert_eq!(coerce_integer(&text).unwrap(), Value::Int64(expected));
    }

    #[test]
    fn coercion_never_panics(raw in ".{0,40}") {
        for ty in [
            FieldType::Text,
            FieldType::Integer,
            FieldType::Float,
            FieldType::Date,
            FieldType::Timestamp,
            FieldType::Bool,
        ] {
            let _ = coerce_value(&raw, ty);
        }
    }

    #[test]
    fn serial_time_of_day_matches_fraction(days in 61u32..80000, seconds in 0u32..86400) {
        let serial = f64::from(days) + (f64::from(seconds) + 0.5) / 86_400.0;
        let parsed = serial_to_datetime(serial).unwrap();
        prop_assert_eq!(parsed.num_seconds_from_midnight(), seconds);
    }

    #[test]
    fn percent_values_keep_their_number(value in -1.0e6f64..1.0e6) {
        let text = format!("{value}%");
        prop_assert_eq!(coerce_float(&text).unwrap(), Value::Float64(value));
    }
}
