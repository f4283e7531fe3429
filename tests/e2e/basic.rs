use crate::e2e::*;

#[test]
fn build_site() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    let out = space.run_expect(&mut assetpipe_command(vec!["build"]))?;
    assert_output_contains(&out, "assetpipe: built 4 files");

    assert_eq!(
        space.read_string("dist/index.html")?,
        "<html>\n  <link href=\"styles/main.css\">\n  <script src=\"app.js\"></script>\n</html>\n"
    );
    assert_eq!(
        space.read_string("dist/styles/main.css")?,
        "@use \"colors\";\nh1 { color: navy; }\n"
    );
    assert_eq!(space.read_string("dist/app.js")?, "console.log(1);\n");
    assert!(!space.exists("dist/styles/_colors.scss"));
    Ok(())
}

#[test]
fn chdir_and_config_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("site/pipeline.conf", "entry a.js\nrule js\n  match = *.js\n  stages = js-trim\n")?;
    space.write("site/a.js", "a();   \n")?;
    space.run_expect(&mut assetpipe_command(vec![
        "-C",
        "site",
        "-f",
        "pipeline.conf",
        "build",
    ]))?;
    assert_eq!(space.read_string("site/dist/a.js")?, "a();\n");
    Ok(())
}

#[test]
fn stage_failure_exits_nonzero() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    space.write("src/styles/main.scss", "h1 { color: navy;\n")?;
    let out = space.run(&mut assetpipe_command(vec!["build"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "styles/main.scss: stage sass: unclosed '{' opened at line 1");
    assert!(!space.exists("dist/index.html"));
    Ok(())
}

#[test]
fn config_errors_are_positioned() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "assets.conf",
        "entry a.js\nrule js\n  match = *.js\n  stages = js-trim uglify\n",
    )?;
    space.write("a.js", "")?;
    let out = space.run(&mut assetpipe_command(vec!["build"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "assets.conf:4:");
    assert_output_contains(&out, "unknown stage \"uglify\"");
    Ok(())
}

#[test]
fn missing_config() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut assetpipe_command(vec!["build"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "assetpipe: error: read assets.conf");
    Ok(())
}

#[test]
fn unmatched_reference() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_site(&space)?;
    space.write("src/index.html", "<img src=\"logo.svg\">\n")?;
    space.write("src/logo.svg", "<svg/>")?;
    let out = space.run(&mut assetpipe_command(vec!["build"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "logo.svg: no rule matches");

    space.write(
        "assets.conf",
        &format!("unmatched = copy\n{}", SITE_CONF),
    )?;
    space.run_expect(&mut assetpipe_command(vec!["build"]))?;
    assert_eq!(space.read_string("dist/logo.svg")?, "<svg/>");
    Ok(())
}
