use apilink::services::transform::TransformSpec;
use serde_json::{json, Value};

fn movie_records(count: usize) -> Value {
    let records: Vec<Value> = (0..count)
        .map(|i| {
            let rating = 7.0 + ((i * 37) % 30) as f64 / 10.0;
            json!({
                "title": format!("movie-{:03}", i),
                "rating": rating,
                "year": 1980 + (i % 40),
            })
        })
        .collect();
    Value::Array(records)
}

#[test]
fn filter_sort_limit_over_large_record_set() {
    let spec = TransformSpec::parse(&json!([
        {"op": "filter", "field": "rating", "operator": "gte", "value": 9.0},
        {"op": "sort", "field": "rating", "direction": "desc"},
        {"op": "limit", "count": 50},
    ]))
    .unwrap();

    let out = spec.apply(&movie_records(250));
    let records = out.as_array().unwrap();

    assert!(records.len() <= 50);
    assert!(!records.is_empty());
    let ratings: Vec<f64> = records
        .iter()
        .map(|r| r["rating"].as_f64().unwrap())
        .collect();
    assert!(ratings.iter().all(|r| *r >= 9.0));
    assert!(ratings.windows(2).all(|pair| pair[0] >= pair[1]));
}

#[test]
fn pipeline_is_pure_over_repeated_invocations() {
    let spec = TransformSpec::parse(&json!({
        "filter": {"field": "year", "operator": "gt", "value": 2000},
        "sort": {"field": "title"},
        "select": ["title", "rating"],
        "limit": 20,
    }))
    .unwrap();
    let input = movie_records(120);
    let first = spec.apply(&input);
    let second = spec.apply(&input);
    assert_eq!(first, second);
    // The input itself is untouched.
    assert_eq!(input, movie_records(120));
}

#[test]
fn empty_input_stays_empty_for_any_spec() {
    for raw in [
        json!({"limit": 10}),
        json!({"sort": {"field": "rating", "direction": "desc"}}),
        json!([{"op": "filter", "field": "x", "operator": "eq", "value": 1}]),
    ] {
        let spec = TransformSpec::parse(&raw).unwrap();
        assert_eq!(spec.apply(&json!([])), json!([]));
    }
}

#[test]
fn weather_style_selection_keeps_only_requested_fields() {
    let body = json!({
        "coord": {"lon": 116.39, "lat": 39.9},
        "main": {"temp": 285.5, "feels_like": 283.2, "humidity": 40},
        "weather": [{"id": 800, "main": "Clear"}],
        "wind": {"speed": 3.1},
        "name": "Beijing",
    });
    let spec = TransformSpec::parse(&json!({"select": ["main.temp", "weather"]})).unwrap();
    let out = spec.apply(&body);
    assert_eq!(
        out,
        json!({"main": {"temp": 285.5}, "weather": [{"id": 800, "main": "Clear"}]})
    );
}

#[test]
fn shorthand_object_matches_equivalent_array_form() {
    let shorthand = TransformSpec::parse(&json!({
        "filter": {"field": "rating", "operator": "gte", "value": 8.5},
        "sort": {"field": "rating", "direction": "desc"},
        "select": ["title", "rating"],
        "limit": 10,
    }))
    .unwrap();
    let array_form = TransformSpec::parse(&json!([
        {"op": "filter", "field": "rating", "operator": "gte", "value": 8.5},
        {"op": "sort", "field": "rating", "direction": "desc"},
        {"op": "select", "fields": ["title", "rating"]},
        {"op": "limit", "count": 10},
    ]))
    .unwrap();
    let input = movie_records(90);
    assert_eq!(shorthand.apply(&input), array_form.apply(&input));
}
