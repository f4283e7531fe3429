//! Builds against an in-memory file system, checking emitted outputs, the
//! graph, and how much work incremental rebuilds do.

use assetpipe::config::{self, Config};
use assetpipe::error::Error;
use assetpipe::fs::MemoryFileSystem;
use assetpipe::graph::Artifact;
use assetpipe::orchestrate::{Options, Orchestrator, Phase};
use assetpipe::progress::Progress;
use assetpipe::server::{self, DevServer, Manifest};
use assetpipe::stage::{Chain, Mode, Stage, StageContext, StageOutput};
use assetpipe::stages::builtin_registry;
use assetpipe::work::StateCounts;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// Implementation of Progress that prints nothing.
struct NoProgress {}
impl Progress for NoProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _path: &str, _chain: &Chain) {}
    fn task_finished(&mut self, _path: &str, _result: Result<&Artifact, &Error>) {}
    fn log(&mut self, _msg: &str) {}
}

const CONF: &str = "
root = src
out = dist

entry index.html

rule html
  match = *.html
  stages = html-refs
  stages.production = html-refs html-minify

rule partials
  match = _*.scss
  stages = sass
  emit = false

rule styles
  match = *.scss
  stages = sass css-extract
  stages.production = sass css-minify css-extract
  name.production = [name].[hash].[ext]

rule js
  match = *.js
  stages = js-trim
";

fn load(text: &str) -> anyhow::Result<Config> {
    config::parse("assets.conf", text, &builtin_registry()?)
}

fn options(mode: Mode) -> Options {
    Options {
        mode,
        parallelism: 4,
    }
}

fn site() -> MemoryFileSystem {
    let fs = MemoryFileSystem::new();
    fs.add(
        "src/index.html",
        "<html>\n<head>\n  <link rel=\"stylesheet\" href=\"styles/a.scss\">\n</head>\n<body>\n  <script src=\"app.js\"></script>\n</body>\n</html>\n",
    );
    fs.add(
        "src/styles/a.scss",
        "@import \"vars\";\nbody { color: red; } // main\n",
    );
    fs.add("src/styles/_vars.scss", "$accent: blue;\n");
    fs.add("src/app.js", "let x = 1;   \n\n");
    fs
}

fn text(fs: &MemoryFileSystem, path: &str) -> Option<String> {
    fs.get(path).map(|b| String::from_utf8_lossy(&b).into_owned())
}

#[test]
fn builds_site() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    let report = orch.build()?;
    assert_eq!(orch.phase(), Phase::Idle);
    // The extracted stylesheet is created during the build, so it is not
    // counted among the scheduled nodes.
    assert_eq!(report.built.len(), 4);

    assert_eq!(
        text(&fs, "dist/styles/a.css").as_deref(),
        Some("@import \"vars\";\nbody { color: red; }\n")
    );
    assert_eq!(text(&fs, "dist/app.js").as_deref(), Some("let x = 1;\n"));
    let html = text(&fs, "dist/index.html").unwrap_or_default();
    assert!(html.contains("href=\"styles/a.css\""), "{}", html);
    assert!(html.contains("src=\"app.js\""), "{}", html);

    // Extracted and non-emitted sources write nothing.
    assert_eq!(fs.get("dist/styles/a.scss"), None);
    assert_eq!(fs.get("dist/styles/_vars.scss"), None);

    // The page depends on the extracted stylesheet, not just its source.
    let graph = orch.graph();
    let page = graph.lookup("index.html").unwrap();
    let css = graph.lookup("styles/a.scss#0").unwrap();
    assert!(graph.node(page).deps().contains(&css));
    assert_eq!(
        graph.node(css).artifact().unwrap().output.as_deref(),
        Some("styles/a.css")
    );
    assert_eq!(orch.stage_executions(), 5);
    Ok(())
}

#[test]
fn second_build_is_cached() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    orch.build()?;
    let first = text(&fs, "dist/index.html");
    let executions = orch.stage_executions();

    orch.build()?;
    assert_eq!(orch.stage_executions(), executions);
    assert_eq!(text(&fs, "dist/index.html"), first);
    assert!(orch.cache_stats().hits > 0);
    Ok(())
}

#[test]
fn rebuild_touches_only_affected() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    orch.build()?;
    let executions = orch.stage_executions();

    // Editing a partial rebuilds it, its importer, the extracted css and the
    // page; only the partial's own chain runs again.
    fs.add("src/styles/_vars.scss", "$accent: green;\n");
    let report = orch.rebuild(&["styles/_vars.scss".to_string()]);
    assert!(report.is_success());
    assert_eq!(
        report.built,
        vec![
            "styles/_vars.scss",
            "styles/a.scss",
            "styles/a.scss#0",
            "index.html"
        ]
    );
    assert_eq!(orch.stage_executions(), executions + 1);

    // A script edit leaves the stylesheet alone.
    fs.add("src/app.js", "let x = 2;\n");
    let report = orch.rebuild(&["app.js".to_string()]);
    assert_eq!(report.built, vec!["app.js", "index.html"]);
    assert_eq!(text(&fs, "dist/app.js").as_deref(), Some("let x = 2;\n"));

    // Rewriting a file with the same content is not a change.
    fs.add("src/app.js", "let x = 2;\n");
    let report = orch.rebuild(&["app.js".to_string()]);
    assert!(report.built.is_empty());
    Ok(())
}

#[test]
fn rebuild_discovers_new_references() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    orch.build()?;

    fs.add("src/lib/util.js", "export const y = 2;\n");
    fs.add(
        "src/index.html",
        "<script src=\"app.js\"></script>\n<script src=\"lib/util.js\"></script>\n",
    );
    let report = orch.rebuild(&["index.html".to_string()]);
    assert!(report.is_success());
    assert_eq!(report.built, vec!["lib/util.js", "index.html"]);
    assert_eq!(
        text(&fs, "dist/lib/util.js").as_deref(),
        Some("export const y = 2;\n")
    );
    Ok(())
}

#[test]
fn production_names_and_minifies() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Production), &mut progress);
    orch.build()?;

    let graph = orch.graph();
    let css = graph.lookup("styles/a.scss#0").unwrap();
    let artifact = graph.node(css).artifact().unwrap();
    let output = artifact.output.clone().unwrap();
    assert_eq!(output, format!("styles/a.{}.css", artifact.hash.short()));
    assert_eq!(
        text(&fs, &format!("dist/{}", output)).as_deref(),
        Some("@import \"vars\";body{color:red}")
    );

    let html = text(&fs, "dist/index.html").unwrap_or_default();
    assert!(html.contains(&format!("href=\"{}\"", output)), "{}", html);
    assert!(!html.contains('\n'), "{}", html);
    Ok(())
}

#[test]
fn references_from_subdirectories() -> anyhow::Result<()> {
    let fs = site();
    fs.add(
        "src/pages/about.html",
        "<link href=\"../styles/a.scss\"><link href=\"/styles/a.scss?v=2\">\n",
    );
    let conf = CONF.replace("entry index.html", "entry index.html pages/about.html");
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(&conf)?, options(Mode::Development), &mut progress);
    orch.build()?;
    assert_eq!(
        text(&fs, "dist/pages/about.html").as_deref(),
        Some("<link href=\"../styles/a.css\"><link href=\"../styles/a.css?v=2\">\n")
    );
    Ok(())
}

#[test]
fn aliases_resolve() -> anyhow::Result<()> {
    let fs = MemoryFileSystem::new();
    fs.add("src/main.scss", "@import \"@theme/colors\";\n");
    fs.add("src/vendor/theme/_colors.scss", "$c: red;\n");
    let conf = "root = src\nentry main.scss\nalias @theme = vendor/theme\n\
                rule partials\n  match = _*.scss\n  stages = sass\n  emit = false\n\
                rule styles\n  match = *.scss\n  stages = sass\n  ext = css\n";
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(conf)?, options(Mode::Development), &mut progress);
    orch.build()?;
    let graph = orch.graph();
    let main = graph.lookup("main.scss").unwrap();
    let colors = graph.lookup("vendor/theme/_colors.scss").unwrap();
    assert_eq!(graph.node(main).deps(), &[colors]);
    assert!(fs.get("dist/main.css").is_some());
    Ok(())
}

#[test]
fn unmatched_files() -> anyhow::Result<()> {
    let fs = site();
    fs.add("src/index.html", "<img src=\"logo.png\">\n");
    fs.add("src/logo.png", vec![0x89, b'P', b'N', b'G']);

    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    match orch.build() {
        Err(Error::NoMatch(err)) => assert_eq!(err.path, "logo.png"),
        other => panic!("expected NoMatch, got {:?}", other),
    }
    assert_eq!(fs.get("dist/index.html"), None);

    let conf = format!("unmatched = copy\n{}", CONF);
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(&conf)?, options(Mode::Development), &mut progress);
    orch.build()?;
    assert_eq!(fs.get("dist/logo.png"), Some(vec![0x89, b'P', b'N', b'G']));
    assert_eq!(
        text(&fs, "dist/index.html").as_deref(),
        Some("<img src=\"logo.png\">\n")
    );
    Ok(())
}

#[test]
fn missing_files() -> anyhow::Result<()> {
    let fs = site();
    fs.add("src/index.html", "<link href=\"gone.css\">\n");
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    match orch.build() {
        Err(Error::MissingReference { from, reference }) => {
            assert_eq!(from, "index.html");
            assert_eq!(reference, "gone.css");
        }
        other => panic!("expected MissingReference, got {:?}", other),
    }

    fs.remove("src/index.html");
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    let err = orch.build().unwrap_err();
    assert_eq!(err.to_string(), "entry index.html: file not found");
    Ok(())
}

#[test]
fn stage_failure_skips_dependents() -> anyhow::Result<()> {
    let fs = site();
    fs.add("src/styles/a.scss", "body {\n  color: red;\n");
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    let err = orch.build().unwrap_err();
    match &err {
        Error::Stage(stage) => {
            assert_eq!(stage.path, "styles/a.scss");
            assert_eq!(stage.stage, "sass");
        }
        other => panic!("expected a stage error, got {:?}", other),
    }
    assert!(err.to_string().contains("unclosed '{' opened at line 1"));
    assert_eq!(fs.get("dist/index.html"), None);

    // Fixing the file brings the build back.
    fs.add("src/styles/a.scss", "body {\n  color: red;\n}\n");
    let report = orch.rebuild(&["styles/a.scss".to_string()]);
    assert!(report.is_success(), "{:?}", report.failures);
    assert!(fs.get("dist/index.html").is_some());
    Ok(())
}

#[test]
fn cycles_are_errors() -> anyhow::Result<()> {
    let fs = MemoryFileSystem::new();
    fs.add("a.scss", "@import \"b\";\n");
    fs.add("b.scss", "@import \"a\";\n");
    let conf = "entry a.scss\nrule styles\n  match = *.scss\n  stages = sass\n";
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(conf)?, options(Mode::Development), &mut progress);
    match orch.build() {
        Err(Error::Cycle(err)) => assert_eq!(err.from, "b.scss"),
        other => panic!("expected a cycle, got {:?}", other),
    }
    Ok(())
}

#[test]
fn identical_inputs_transform_once() -> anyhow::Result<()> {
    let fs = MemoryFileSystem::new();
    for name in ["a", "b", "c", "d", "e", "f"] {
        fs.add(format!("{}.js", name), "same();  \n");
    }
    let conf = "entry a.js b.js c.js d.js e.js f.js\nrule js\n  match = *.js\n  stages = js-trim\n";
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(conf)?, options(Mode::Development), &mut progress);
    let report = orch.build()?;
    assert_eq!(report.built.len(), 6);
    assert_eq!(orch.stage_executions(), 1);
    assert_eq!(text(&fs, "dist/f.js").as_deref(), Some("same();\n"));
    Ok(())
}

#[test]
fn clean_removes_stale_outputs() -> anyhow::Result<()> {
    let fs = site();
    fs.add("dist/old.js", "stale");
    let conf = format!("clean = true\n{}", CONF);
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(&conf)?, options(Mode::Development), &mut progress);
    orch.build()?;
    assert_eq!(fs.get("dist/old.js"), None);
    assert!(fs.get("dist/app.js").is_some());
    Ok(())
}

/// DevServer that records every manifest it is sent.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Manifest>>>);
impl Recorder {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
impl DevServer for Recorder {
    fn rebuild_complete(&mut self, manifest: &Manifest) {
        self.0.lock().unwrap().push(manifest.clone());
    }
}

#[test]
fn watch_rebuilds_on_change() -> anyhow::Result<()> {
    let fs = site();
    let conf = format!("debounce_ms = 10\npoll_ms = 10\n{}", CONF);
    let config = load(&conf)?;
    let recorder = Recorder::default();
    let (events, rx) = server::channel();
    let deadline = Instant::now() + Duration::from_secs(20);

    std::thread::scope(|s| -> anyhow::Result<()> {
        let editor = recorder.clone();
        let fs = &fs;
        s.spawn(move || {
            while editor.count() < 1 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            // A broken edit, then a fix; neither ends the watch.
            fs.add("src/app.js", "let x = 3;\n");
            events.file_changed("app.js");
            while editor.count() < 2 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            fs.add("src/styles/a.scss", "body {\n");
            events.file_changed("styles/a.scss");
            while editor.count() < 3 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            fs.add("src/styles/a.scss", "body { color: teal; }\n");
            events.file_changed("styles/a.scss");
        });

        let mut progress = NoProgress {};
        let mut orch = Orchestrator::new(fs, config, options(Mode::Development), &mut progress);
        let mut server = recorder.clone();
        let stop = || recorder.count() >= 4 || Instant::now() > deadline;
        orch.watch(&mut server, Some(rx), &stop);
        assert_eq!(orch.phase(), Phase::Idle);
        Ok(())
    })?;

    let manifests = recorder.0.lock().unwrap();
    assert_eq!(manifests.len(), 4);
    assert!(manifests[0].is_success());
    assert_eq!(
        manifests[0].outputs.get("styles/a.scss"),
        Some(&vec!["styles/a.css".to_string()])
    );
    assert_eq!(manifests[1].rebuilt, vec!["app.js", "index.html"]);
    assert_eq!(manifests[2].failed, vec!["styles/a.scss"]);
    assert!(manifests[3].is_success());
    assert_eq!(
        text(&fs, "dist/styles/a.css").as_deref(),
        Some("body { color: teal; }\n")
    );
    Ok(())
}

#[test]
fn dropped_references_are_pruned() -> anyhow::Result<()> {
    let fs = site();
    let mut progress = NoProgress {};
    let mut orch = Orchestrator::new(&fs, load(CONF)?, options(Mode::Development), &mut progress);
    orch.build()?;
    let nodes = orch.graph().len();

    fs.add("src/index.html", "<script src=\"app.js\"></script>\n");
    let report = orch.rebuild(&["index.html".to_string()]);
    assert!(report.is_success());
    assert_eq!(report.built, vec!["index.html"]);
    let graph = orch.graph();
    assert_eq!(graph.len(), nodes - 3);
    assert_eq!(graph.lookup("styles/a.scss"), None);
    assert_eq!(graph.lookup("styles/_vars.scss"), None);
    assert_eq!(graph.lookup("styles/a.scss#0"), None);
    let manifest = orch.manifest(&report);
    assert_eq!(
        manifest.outputs.keys().collect::<Vec<_>>(),
        vec!["app.js", "index.html"]
    );

    // Referencing the stylesheet again brings it back.
    fs.add(
        "src/index.html",
        "<link href=\"styles/a.scss\"><script src=\"app.js\"></script>\n",
    );
    let report = orch.rebuild(&["index.html".to_string()]);
    assert!(report.is_success());
    assert!(report.built.contains(&"styles/a.scss".to_string()));
    assert_eq!(
        text(&fs, "dist/index.html").as_deref(),
        Some("<link href=\"styles/a.css\"><script src=\"app.js\"></script>\n")
    );
    Ok(())
}

/// Passes content through after a pause, announcing each start.
struct Slow(Mutex<mpsc::Sender<()>>);
impl Stage for Slow {
    fn id(&self) -> &str {
        "slow"
    }
    fn transform(&self, input: &[u8], _ctx: &StageContext) -> anyhow::Result<StageOutput> {
        let _ = self.0.lock().unwrap().send(());
        std::thread::sleep(Duration::from_millis(400));
        Ok(StageOutput::new(input.to_vec()))
    }
}

#[test]
fn edit_during_build_restarts_with_new_references() -> anyhow::Result<()> {
    let fs = MemoryFileSystem::new();
    fs.add("src/index.html", "<script src=\"a.js\"></script>\n");
    fs.add("src/a.js", "a();\n");
    fs.add("src/b.js", "b();\n");
    let (started, starts) = mpsc::channel();
    let mut registry = builtin_registry()?;
    registry.register(Arc::new(Slow(Mutex::new(started))))?;
    let conf = "root = src\nout = dist\npoll_ms = 10\ndebounce_ms = 10\nentry index.html\n\
                rule html\n  match = *.html\n  stages = html-refs slow\n\
                rule js\n  match = *.js\n  stages = js-trim\n";
    let config = config::parse("assets.conf", conf, &registry)?;
    let recorder = Recorder::default();
    let (events, rx) = server::channel();
    let deadline = Instant::now() + Duration::from_secs(20);

    std::thread::scope(|s| -> anyhow::Result<()> {
        let fs = &fs;
        s.spawn(move || {
            // Edit the page while its first run is inside the slow stage.
            if starts.recv_timeout(Duration::from_secs(10)).is_ok() {
                fs.add(
                    "src/index.html",
                    "<script src=\"a.js\"></script><script src=\"b.js\"></script>\n",
                );
                events.file_changed("index.html");
            }
        });

        let mut progress = NoProgress {};
        let mut orch = Orchestrator::new(fs, config, options(Mode::Development), &mut progress);
        let mut server = recorder.clone();
        let stop = || recorder.count() >= 1 || Instant::now() > deadline;
        orch.watch(&mut server, Some(rx), &stop);
        Ok(())
    })?;

    let manifests = recorder.0.lock().unwrap();
    assert!(manifests[0].is_success(), "{:?}", manifests[0]);
    assert_eq!(manifests[0].rebuilt, vec!["a.js", "b.js", "index.html"]);
    assert_eq!(
        text(&fs, "dist/index.html").as_deref(),
        Some("<script src=\"a.js\"></script><script src=\"b.js\"></script>\n")
    );
    assert_eq!(text(&fs, "dist/b.js").as_deref(), Some("b();\n"));
    Ok(())
}
