mod common;

use std::{fs, path::Path, thread::sleep, time::Duration};

use anyhow::Result;
use common::{data_rows, init_logging, MvnLogp};
use dram_rs::{
    run, ChainStatus, DramError, OutputSettings, RunConfiguration, Sampler, StartPoint, TextConfig,
};
use pretty_assertions::assert_eq;

fn settings(prefix: &Path, seed: u64) -> RunConfiguration {
    let mut settings = RunConfiguration::new(4);
    settings.seed = seed;
    settings.chain_size = 300;
    settings.num_chains = 2;
    settings.start_point = StartPoint::Random {
        lower: vec![-25.; 4],
        upper: vec![25.; 4],
    };
    settings.output = Some(OutputSettings::new(prefix));
    settings
}

fn dram_error(err: &anyhow::Error) -> Option<&DramError> {
    err.downcast_ref::<DramError>()
}

#[test]
fn complete_output_is_reused() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("out").join("mvn");
    let first = run(4, MvnLogp::example(), settings(&prefix, 1))?;

    let density = MvnLogp::example();
    let counter = density.counter();
    let second = run(4, density, settings(&prefix, 1))?;
    assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 0);
    for (a, b) in first.chains.iter().zip(second.chains.iter()) {
        assert_eq!(a.records, b.records);
        assert_eq!(b.summary.status, ChainStatus::Complete);
        assert_eq!(a.files, b.files);
    }
    Ok(())
}

#[test]
fn interrupted_chains_are_resumed() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("mvn");
    let first = run(4, MvnLogp::example(), settings(&prefix, 2))?;
    let files = first.chains[0].files.clone().expect("chain files");
    let original = fs::read_to_string(&files.chain)?;

    // Cut the chain file in the middle of row 151, as if the process had
    // been killed while writing.
    let header_len = original.lines().take_while(|l| l.starts_with('#')).count() + 1;
    let lines = original.lines().collect::<Vec<_>>();
    let mut truncated = lines[..header_len + 150].join("\n");
    truncated.push('\n');
    truncated.push_str(&lines[header_len + 150][..5]);
    fs::write(&files.chain, truncated)?;
    fs::remove_file(&files.report)?;

    let second = run(4, MvnLogp::example(), settings(&prefix, 2))?;
    let chain = &second.chains[0];
    assert_eq!(chain.summary.status, ChainStatus::Complete);

    let resumed = fs::read_to_string(&files.chain)?;
    let rows = data_rows(&resumed);
    assert_eq!(rows.len(), 300);
    assert_eq!(&rows[..149], &data_rows(&original)[..149]);
    assert_eq!(chain.records.len(), 300);

    let report = fs::read_to_string(&files.report)?;
    assert!(report.contains("status = complete"));

    // The second chain was complete and is untouched.
    assert_eq!(second.chains[1].records, first.chains[1].records);
    Ok(())
}

#[test]
fn incompatible_output_fails_before_sampling() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("mvn");
    run(4, MvnLogp::example(), settings(&prefix, 3))?;

    let density = MvnLogp::example();
    let counter = density.counter();
    let err = run(4, density, settings(&prefix, 4)).err().expect("seed differs");
    assert!(
        matches!(dram_error(&err), Some(DramError::IncompatibleOutput { .. })),
        "{:#}",
        err
    );
    assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn foreign_files_are_not_overwritten() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("mvn");
    let chain_file = dir.path().join("mvn_process_1_chain.txt");
    fs::write(&chain_file, "something else\n")?;

    let err = run(4, MvnLogp::example(), settings(&prefix, 3))
        .err()
        .expect("existing file");
    assert!(matches!(dram_error(&err), Some(DramError::OutputExists(_))));
    assert_eq!(fs::read_to_string(&chain_file)?, "something else\n");
    Ok(())
}

#[test]
fn overwrite_replaces_existing_output() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("mvn");
    let chain_file = dir.path().join("mvn_process_1_chain.txt");
    fs::write(&chain_file, "something else\n")?;

    let mut settings = settings(&prefix, 5);
    if let Some(output) = settings.output.as_mut() {
        output.overwrite_requested = true;
    }
    let result = run(4, MvnLogp::example(), settings)?;
    let text = fs::read_to_string(&chain_file)?;
    assert!(text.starts_with("# format = "));
    assert_eq!(data_rows(&text).len(), 300);
    assert!(result
        .summaries()
        .all(|summary| summary.status == ChainStatus::Complete));
    Ok(())
}

#[test]
fn invalid_configuration_fails_before_sampling() {
    let mut settings = RunConfiguration::new(4);
    settings.domain.lower[2] = 5.;
    settings.domain.upper[2] = 1.;
    let err = run(4, MvnLogp::example(), settings).err().expect("bad bounds");
    assert!(matches!(dram_error(&err), Some(DramError::Configuration(_))));

    let err = run(3, MvnLogp::example(), RunConfiguration::new(4))
        .err()
        .expect("dimension mismatch");
    assert!(matches!(dram_error(&err), Some(DramError::Configuration(_))));
}

#[test]
fn unwritable_prefix_fails_before_sampling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "a regular file\n")?;
    let prefix = blocker.join("sub").join("run");

    let density = MvnLogp::example();
    let counter = density.counter();
    let err = run(4, density, settings(&prefix, 7))
        .err()
        .expect("output directory cannot be created");
    assert!(
        matches!(dram_error(&err), Some(DramError::Io { .. })),
        "{:#}",
        err
    );
    assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn aborted_runs_leave_incomplete_reports() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let prefix = dir.path().join("mvn");
    let mut settings = settings(&prefix, 8);
    settings.chain_size = 10_000_000;
    settings.max_steps = 100_000_000;
    let output = settings.output.clone().expect("output settings");

    let density = MvnLogp::example();
    let counter = density.counter();
    let sampler = Sampler::new(density, settings, TextConfig::new(output), 2, None)?;
    while counter.load(std::sync::atomic::Ordering::Relaxed) < 5_000 {
        sleep(Duration::from_millis(1));
    }
    let (result, trace) = sampler.abort();
    result?;
    let trace = trace.expect("aborted chains are collected");
    assert_eq!(trace.chains.len(), 2);

    for chain in trace.chains.iter() {
        assert_eq!(chain.summary.status, ChainStatus::Incomplete);
        let files = chain.files.clone().expect("chain files");
        let report = fs::read_to_string(&files.report)?;
        assert!(report.starts_with("status = incomplete\n"), "{}", report);

        let text = fs::read_to_string(&files.chain)?;
        let rows = data_rows(&text);
        assert_eq!(rows.len(), chain.records.len());
        assert!(!rows.is_empty());
        for row in rows {
            let fields = row.split(',').collect::<Vec<_>>();
            assert_eq!(fields.len(), 5 + 4, "{}", row);
            assert!(fields.iter().all(|field| field.parse::<f64>().is_ok()), "{}", row);
        }
    }
    Ok(())
}
