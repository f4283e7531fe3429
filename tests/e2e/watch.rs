//! Change detection and rebuilds against the real file system.

use crate::e2e::*;
use assetpipe::config;
use assetpipe::fs::RealFileSystem;
use assetpipe::orchestrate::{Options, Orchestrator};
use assetpipe::progress::ConsoleProgress;
use assetpipe::server::{DevServer, Manifest};
use assetpipe::stage::Mode;
use assetpipe::stages::builtin_registry;
use assetpipe::watch::ChangeFeed;
use std::time::{Duration, SystemTime};

#[test]
fn feed_sees_disk_changes() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.js", "a")?;
    space.write("b.js", "b")?;
    space.write("notes.txt", "")?;
    let mut feed = ChangeFeed::new(space.path());
    feed.set_watched(["a.js".to_string(), "b.js".to_string()]);
    feed.watch_disk(Duration::from_millis(20))?;
    assert!(feed.poll().is_empty());

    // Touching the mtime alone is a change.
    let later = filetime::FileTime::from_system_time(SystemTime::now() + Duration::from_secs(10));
    filetime::set_file_mtime(space.path().join("b.js"), later)?;
    std::fs::write(space.path().join("notes.txt"), "unwatched")?;
    assert_eq!(feed.wait(Duration::from_secs(10)), vec!["b.js"]);

    std::fs::remove_file(space.path().join("a.js"))?;
    let mut changed = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !changed.iter().any(|p: &String| p == "a.js") && std::time::Instant::now() < deadline {
        changed.extend(feed.wait(Duration::from_millis(200)));
    }
    assert!(changed.iter().all(|p| p == "a.js" || p == "b.js"), "{:?}", changed);
    assert!(changed.contains(&"a.js".to_string()));
    Ok(())
}

struct Rounds(Vec<Manifest>);
impl DevServer for Rounds {
    fn rebuild_complete(&mut self, manifest: &Manifest) {
        self.0.push(manifest.clone());
    }
}

#[test]
fn watch_on_disk() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    let conf = format!(
        "root = {}/src\nout = {}/dist\npoll_ms = 10\ndebounce_ms = 50\n{}",
        space.path().display(),
        space.path().display(),
        SITE_CONF.replace("root = src\nout = dist\n", "")
    );
    let config = config::parse("assets.conf", &conf, &builtin_registry()?)?;
    let fs = RealFileSystem::new();
    let mut progress = ConsoleProgress::new(false);
    let options = Options {
        mode: Mode::Development,
        parallelism: 2,
    };
    let mut orch = Orchestrator::new(&fs, config, options, &mut progress);

    let mut rounds = Rounds(Vec::new());
    let js = space.path().join("src/app.js");
    let started = std::time::Instant::now();
    let stop = || {
        // Edit once the initial build is out; stop after the rebuild.
        if space.exists("dist/app.js") && !space.exists("edited") {
            let _ = std::fs::write(space.path().join("edited"), "");
            let _ = std::fs::write(&js, "console.log(2);\n");
        }
        space.read_string("dist/app.js").ok().as_deref() == Some("console.log(2);\n")
            || started.elapsed() > Duration::from_secs(20)
    };
    orch.watch(&mut rounds, None, &stop);

    assert_eq!(space.read_string("dist/app.js")?, "console.log(2);\n");
    assert!(rounds.0.len() >= 2);
    assert!(
        rounds.0[1..].iter().any(|m| m.rebuilt == vec!["app.js", "index.html"]),
        "{:?}",
        rounds.0
    );
    Ok(())
}
