use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::{Value, json};

const LISTING_URL: &str = "https://weedmaps.com/brands/acme/products";

const LISTING_HTML: &str = r#"<!doctype html>
<html>
  <body>
    <div class="product-card">
      <h3 class="name">Blue Dream</h3>
      <span class="price">$45</span>
    </div>
    <div class="product-card">
      <h3 class="name">OG Kush</h3>
      <span class="price">$40</span>
    </div>
    <nav class="pagination">
      <a href="/brands/acme/products?page=2">2</a>
      <a href="/brands/acme/products?page=3">3</a>
    </nav>
  </body>
</html>
"#;

fn new_session(store: &Path) -> anyhow::Result<String> {
    let output = cargo_bin_cmd!("pagesift")
        .args(["session", "new", "--store-dir"])
        .arg(store)
        .args(["--url", LISTING_URL])
        .output()?;
    anyhow::ensure!(output.status.success(), "session new failed");
    Ok(String::from_utf8(output.stdout)?.trim().to_owned())
}

#[test]
fn extract_uses_listing_cards_without_a_model() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = tmp.path().join("store");
    let id = new_session(&store)?;
    let raw = tmp.path().join("listing.html");
    std::fs::write(&raw, LISTING_HTML)?;

    let output = cargo_bin_cmd!("pagesift")
        .args(["extract", "--engine", "noop", "--store-dir"])
        .arg(&store)
        .args(["--session", &id, "--url", LISTING_URL, "--raw"])
        .arg(&raw)
        .args(["--field", "product_name", "--field", "price"])
        .output()?;
    assert!(
        output.status.success(),
        "extract failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let outcome: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(outcome["skipped"], json!([]));
    assert_eq!(outcome["totals"]["input_tokens"], 0);
    assert_eq!(outcome["totals"]["output_tokens"], 0);

    let result = &outcome["results"][0];
    assert_eq!(result["provenance"], "heuristic");
    let expected = json!([
        { "product_name": "Blue Dream", "price": "$45" },
        { "product_name": "OG Kush", "price": "$40" },
    ]);
    assert_eq!(result["records"], expected);

    let output_path = result["output_path"]
        .as_str()
        .expect("extraction output was persisted");
    assert!(output_path.ends_with("_acme_formatted_data.json"));
    assert!(Path::new(output_path).starts_with(store.join(&id)));
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(output_path)?)?;
    assert_eq!(saved, json!({ "listings": expected }));
    Ok(())
}

#[test]
fn paginate_reads_the_pagination_container() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = tmp.path().join("store");
    let id = new_session(&store)?;
    let raw = tmp.path().join("listing.html");
    std::fs::write(&raw, LISTING_HTML)?;

    let output = cargo_bin_cmd!("pagesift")
        .args(["paginate", "--engine", "noop", "--store-dir"])
        .arg(&store)
        .args(["--session", &id, "--url", LISTING_URL, "--raw"])
        .arg(&raw)
        .output()?;
    assert!(output.status.success());

    let outcome: Value = serde_json::from_slice(&output.stdout)?;
    let result = &outcome["results"][0];
    assert_eq!(result["provenance"], "heuristic");
    assert_eq!(result["strategy"], "container");
    assert_eq!(
        result["page_urls"],
        json!([
            "https://weedmaps.com/brands/acme/products?page=2",
            "https://weedmaps.com/brands/acme/products?page=3",
        ])
    );
    let output_path = result["output_path"].as_str().expect("persisted");
    assert!(output_path.ends_with("_acme_pagination.json"));
    Ok(())
}

#[test]
fn missing_raw_file_is_skipped_not_fatal() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = tmp.path().join("store");
    let id = new_session(&store)?;

    let output = cargo_bin_cmd!("pagesift")
        .args(["extract", "--engine", "noop", "--store-dir"])
        .arg(&store)
        .args(["--session", &id, "--url", LISTING_URL, "--raw"])
        .arg(tmp.path().join("does-not-exist.html"))
        .args(["--field", "product_name"])
        .output()?;
    assert!(output.status.success());

    let outcome: Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(outcome["results"], json!([]));
    assert_eq!(outcome["skipped"][0]["url"], LISTING_URL);
    assert_eq!(
        outcome["skipped"][0]["reason"],
        format!("no raw content for {LISTING_URL}")
    );
    Ok(())
}

#[test]
fn mismatched_url_and_raw_counts_fail() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = tmp.path().join("store");
    let id = new_session(&store)?;

    cargo_bin_cmd!("pagesift")
        .args(["extract", "--engine", "noop", "--store-dir"])
        .arg(&store)
        .args([
            "--session",
            &id,
            "--url",
            LISTING_URL,
            "--url",
            "https://weedmaps.com/brands/acme/products?page=2",
            "--raw",
            "only-one.html",
            "--field",
            "product_name",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("same number of times"));
    Ok(())
}
