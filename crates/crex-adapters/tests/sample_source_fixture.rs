use crex_adapters::{adapter_for_source, load_fixture_page};

#[test]
fn sample_source_fixture_parses_into_raw_listings() {
    let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/sample-source/sample.html");
    let html = load_fixture_page(&fixture).expect("fixture should be readable");

    let adapter = adapter_for_source("sample-source").expect("sample-source registered");
    let listings = adapter
        .parse_page("https://sample.example/listings", &html)
        .expect("fixture parses");

    assert_eq!(listings.len(), 3);
    assert_eq!(listings[0].property_name.as_deref(), Some("Monarch Tower"));
    assert_eq!(
        listings[0].listing_url.as_deref(),
        Some("https://sample.example/listings/monarch-tower-400")
    );
    // Empty markup cells come through as absent, not empty strings.
    assert_eq!(listings[1].floor_suite, None);
    // The third card has no link; identity falls back to name + suite later.
    assert_eq!(listings[2].listing_url, None);
    assert_eq!(listings[2].address, None);
}
