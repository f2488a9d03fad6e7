use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hepcalc"))
}

fn tmp_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("hepcalc_cli_{}_{}_{}", std::process::id(), nanos, tag));
    fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

const ANALYSIS: &str = r##"
processes:
  - name: ttbar
    files: [ttbar.json]
    style: {label: "t#bar{t}", fill_color: "#d62728"}
  - name: data
    files: [data.json]
regions:
  cr:
    selection: "njet == 2"
    weight: w
    label: CR
  sr:
    selection: "njet >= 3"
    weight: w
    binning: [0, 100, 250]
requests:
  ttbar_cr: {kind: count, process: ttbar, region: cr}
  ttbar_est: {kind: scaled, input: ttbar_cr, factor: 0.5}
  ttbar_met: {kind: histogram, process: ttbar, region: sr, expression: met}
  data_met: {kind: histogram, process: data, region: sr, expression: met}
  data_over_mc: {kind: ratio, numerator: data_met, denominator: ttbar_met}
  ttbar_syst:
    kind: uncertainty
    nominal: ttbar_met
    statistical: true
    variations:
      lumi: {overall: [1.02, 0.98]}
"##;

fn write_fixture(dir: &Path) -> PathBuf {
    fs::write(
        dir.join("ttbar.json"),
        r#"{"events": {"njet": [2, 2, 3, 4], "met": [10, 20, 50, 150], "w": [1.0, 3.0, 2.0, 1.0]}}"#,
    )
    .unwrap();
    fs::write(
        dir.join("data.json"),
        r#"{"events": {"njet": [3, 3, 5], "met": [40, 60, 200], "w": [1, 1, 1]}}"#,
    )
    .unwrap();
    let analysis = dir.join("analysis.yaml");
    fs::write(&analysis, ANALYSIS).unwrap();
    analysis
}

fn parse_stdout(out: &Output) -> serde_json::Value {
    assert!(out.status.success(), "hepcalc failed, stderr={}", String::from_utf8_lossy(&out.stderr));
    serde_json::from_slice(&out.stdout).expect("stdout should be valid JSON")
}

#[test]
fn version_smoke() {
    let out = run(&["version"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("hepcalc "));
}

#[test]
fn evaluate_writes_results_json() {
    let dir = tmp_dir("evaluate");
    let analysis = write_fixture(&dir);

    let v = parse_stdout(&run(&["evaluate", "--config", analysis.to_str().unwrap()]));
    assert_eq!(v["schema_version"], "hepcalc_results_v1");

    let est = &v["results"]["ttbar_est"]["value"];
    assert_eq!(est["kind"], "estimation");
    assert_eq!(est["shape"], "count");
    assert_eq!(est["value"].as_f64().unwrap(), 2.0);
    assert_eq!(est["variance"].as_f64().unwrap(), 2.5);

    let ratio = &v["results"]["data_over_mc"]["value"];
    let contents: Vec<f64> =
        ratio["contents"].as_array().unwrap().iter().map(|x| x.as_f64().unwrap()).collect();
    assert_eq!(contents, vec![1.0, 1.0]);

    assert_eq!(v["results"]["ttbar_syst"]["value"]["kind"], "uncertainty");
    // Three base calculations behind six requests, one execution each.
    assert_eq!(v["stats"]["executions"], 3);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn persistent_cache_is_reused_across_runs() {
    let dir = tmp_dir("persist");
    let analysis = write_fixture(&dir);
    let env = dir.join("env.yaml");
    fs::write(&env, "threads: 2\ncache: {kind: filesystem, path: cache}\n").unwrap();
    let args =
        ["evaluate", "--config", analysis.to_str().unwrap(), "--env", env.to_str().unwrap()];

    let first = parse_stdout(&run(&args));
    assert_eq!(first["stats"]["executions"], 3);
    let second = parse_stdout(&run(&args));
    assert_eq!(second["stats"]["executions"], 0);
    assert_eq!(first["results"], second["results"]);

    let stats = parse_stdout(&run(&["cache", "stats", "--env", env.to_str().unwrap()]));
    assert_eq!(stats["entries"], 3);

    let fps = parse_stdout(&run(&["fingerprint", "--config", analysis.to_str().unwrap()]));
    let fp = fps["ttbar_cr"].as_str().unwrap().to_string();
    assert_eq!(fp.len(), 64);
    assert!(dir.join("cache").join(&fp[..2]).join(format!("{fp}.json")).is_file());

    let cleared = parse_stdout(&run(&[
        "cache",
        "clear",
        "--env",
        env.to_str().unwrap(),
        "--fingerprint",
        &fp,
    ]));
    assert_eq!(cleared["entries"], 2);
    let cleared = parse_stdout(&run(&["cache", "clear", "--env", env.to_str().unwrap()]));
    assert_eq!(cleared["entries"], 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn plot_artifacts_carry_display_metadata() {
    let dir = tmp_dir("plots");
    let analysis = write_fixture(&dir);
    let plots = dir.join("plots");
    let out = run(&[
        "evaluate",
        "--config",
        analysis.to_str().unwrap(),
        "--plot-dir",
        plots.to_str().unwrap(),
        "--output",
        dir.join("results.json").to_str().unwrap(),
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let art: serde_json::Value =
        serde_json::from_slice(&fs::read(plots.join("ttbar_syst.json")).unwrap()).unwrap();
    assert_eq!(art["schema_version"], "hepcalc_plot_v1");
    assert_eq!(art["process"]["label"], "t#bar{t}");
    assert_eq!(art["edges"].as_array().unwrap().len(), 3);
    assert!(art["band"]["up"].is_array());

    let cr: serde_json::Value =
        serde_json::from_slice(&fs::read(plots.join("ttbar_cr.json")).unwrap()).unwrap();
    assert_eq!(cr["region"]["label"], "CR");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn failing_request_is_reported_and_isolated() {
    let dir = tmp_dir("failing");
    let analysis = write_fixture(&dir);
    let broken = ANALYSIS.to_string()
        + "  broken: {kind: count, process: ttbar, region: cr, variation: {kind: reweighted, weight: missing_field}}\n";
    fs::write(&analysis, broken).unwrap();
    let results = dir.join("results.json");

    let out = run(&[
        "evaluate",
        "--config",
        analysis.to_str().unwrap(),
        "--output",
        results.to_str().unwrap(),
    ]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("1 of 7 requests failed"));

    let v: serde_json::Value = serde_json::from_slice(&fs::read(&results).unwrap()).unwrap();
    assert!(v["results"]["broken"]["error"].as_str().unwrap().contains("missing_field"));
    assert!(v["results"]["ttbar_est"]["value"].is_object());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn local_override_is_applied() {
    let dir = tmp_dir("local");
    let analysis = write_fixture(&dir);
    fs::write(
        dir.join("analysis.local.yaml"),
        "requests:\n  only: {kind: count, process: data, region: sr}\n",
    )
    .unwrap();

    let v = parse_stdout(&run(&["evaluate", "--config", analysis.to_str().unwrap()]));
    let results = v["results"].as_object().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results["only"]["value"]["value"].as_f64().unwrap(), 3.0);

    let _ = fs::remove_dir_all(&dir);
}
