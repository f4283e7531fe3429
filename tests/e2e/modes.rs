use crate::e2e::*;

/// Emitted files under `dir`, relative to it.
fn listing(space: &TestSpace, dir: &str) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(space.path().join(dir))? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[test]
fn production_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    space.run_expect(&mut assetpipe_command(vec!["--mode", "production", "build"]))?;

    let styles = listing(&space, "dist/styles")?;
    assert_eq!(styles.len(), 1, "{:?}", styles);
    let css = &styles[0];
    assert!(css.starts_with("main.") && css.ends_with(".css"), "{}", css);
    // "main." + 8 hex digits + ".css"
    assert_eq!(css.len(), 17, "{}", css);
    assert_eq!(
        space.read_string(&format!("dist/styles/{}", css))?,
        "@use \"colors\";h1{color:navy}"
    );
    assert_eq!(
        space.read_string("dist/index.html")?,
        format!(
            "<html><link href=\"styles/{}\"><script src=\"app.js\"></script></html>",
            css
        )
    );
    Ok(())
}

#[test]
fn modes_do_not_share_outputs() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    space.run_expect(&mut assetpipe_command(vec!["-m", "dev", "build"]))?;
    let dev = space.read_string("dist/index.html")?;
    space.run_expect(&mut assetpipe_command(vec!["-m", "prod", "build"]))?;
    let prod = space.read_string("dist/index.html")?;
    assert_ne!(dev, prod);
    Ok(())
}

#[test]
fn bad_flags() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;

    let out = space.run(&mut assetpipe_command(vec!["--mode", "staging", "build"]))?;
    assert!(!out.status.success());

    let out = space.run(&mut assetpipe_command(vec!["-j", "0", "build"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "invalid -j 0");

    let out = space.run(&mut assetpipe_command(vec!["-d", "list", "build"]))?;
    assert_output_contains(&out, "trace");
    Ok(())
}

#[test]
fn trace_is_written() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    space.run_expect(&mut assetpipe_command(vec!["-d", "trace", "build"]))?;
    let trace = space.read_string("trace.json")?;
    assert!(trace.contains("\"sass\""), "{}", trace);
    Ok(())
}
