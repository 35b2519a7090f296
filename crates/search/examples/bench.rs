use std::time::Instant;

use sift_core::{SearchConfig, TextOptions};
use sift_search::RecordIndex;

struct Doc {
    id: String,
    name: String,
    desc: String,
    platform: Vec<String>,
}

fn gen_doc(i: usize) -> Doc {
    let verb = match i % 4 {
        0 => "collect",
        1 => "exfiltrate",
        2 => "escalate",
        _ => "persist",
    };
    Doc {
        id: format!("T{:04}.{:03}", i / 1000, i % 1000),
        name: format!("{verb} via channel {}", i % 50),
        desc: format!("adversaries may {verb} using technique variant {i} on host group {}", i % 20),
        platform: vec![format!("platform-{}", i % 5), format!("arch-{}", i % 3)],
    }
}

fn percentile_us(xs: &mut [u128], p: f64) -> u128 {
    xs.sort_unstable();
    let idx = ((xs.len() as f64 - 1.0) * p).round() as usize;
    xs[idx]
}

fn main() {
    let n: usize = std::env::var("SIFT_BENCH_DOCS").ok().and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let fuzzy: f32 = std::env::var("SIFT_BENCH_FUZZY").ok().and_then(|s| s.parse().ok()).unwrap_or(0.15);

    eprintln!("generating {} docs", n);
    let docs: Vec<Doc> = (0..n).map(gen_doc).collect();
    let cfg = SearchConfig::new(|d: &Doc| Ok(d.id.clone()))
        .search_field("id", |d| Ok(d.id.clone()))
        .search_field("name", |d| Ok(d.name.clone()))
        .search_field("desc", |d| Ok(d.desc.clone()))
        .filter_field("Platform", |d| Ok(d.platform.clone()))
        .text_options(TextOptions { fuzzy, exact_patterns: vec![r"(?i)^t\d+".into()], ..TextOptions::default() });

    let t0 = Instant::now();
    let index = match RecordIndex::build(&docs, &cfg) {
        Ok(idx) => idx,
        Err(e) => {
            eprintln!("index build failed: {e}");
            std::process::exit(1);
        }
    };
    println!("index_build: {:.1}ms docs={} terms={}", t0.elapsed().as_secs_f64() * 1_000.0, n, index.term_count());

    let exact: Vec<String> = (0..20).map(|i| format!("channel {}", i)).collect();
    let prefix: Vec<String> = ["col", "exf", "esc", "pers", "adv"].iter().map(|s| s.to_string()).collect();
    let typos: Vec<String> = ["colect", "exfiltrat", "escalte", "persst"].iter().map(|s| s.to_string()).collect();
    let ids: Vec<String> = (0..20).map(|i| format!("t{:04}", i)).collect();

    let run = |label: &str, qs: &[String]| {
        let mut times: Vec<u128> = Vec::with_capacity(qs.len());
        let mut hits = 0usize;
        for q in qs {
            let t = Instant::now();
            hits += index.query(q).len();
            times.push(t.elapsed().as_micros());
        }
        let p50 = percentile_us(&mut times.clone(), 0.50) as f64 / 1000.0;
        let p99 = percentile_us(&mut times, 0.99) as f64 / 1000.0;
        println!("{}: p50={:.3}ms p99={:.3}ms ({} queries, {} hits)", label, p50, p99, qs.len(), hits);
    };

    run("exact", &exact);
    run("prefix", &prefix);
    run("fuzzy", &typos);
    run("ids", &ids);
    run("wildcard", &[String::new()]);
}
