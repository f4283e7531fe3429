//! Support code for e2e tests, which run assetpipe as a binary.

mod basic;
mod modes;
mod watch;

pub fn assetpipe_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("assetpipe")
}

pub fn assetpipe_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(assetpipe_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", std::str::from_utf8(&out.stdout).unwrap());
    print!("{}", std::str::from_utf8(&out.stderr).unwrap());
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// Manages a temporary directory for invoking assetpipe.
pub struct TestSpace {
    dir: tempfile::TempDir,
}
impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Write a file into the working space, creating directories as needed.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn read_string(&self, path: &str) -> anyhow::Result<String> {
        Ok(String::from_utf8(self.read(path)?)?)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    /// Invoke assetpipe, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// A small site: a page, a stylesheet with a partial, and a script.
pub const SITE_CONF: &str = "
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

pub fn write_site(space: &TestSpace) -> anyhow::Result<()> {
    space.write("assets.conf", SITE_CONF)?;
    space.write(
        "src/index.html",
        "<html>\n  <link href=\"styles/main.scss\">\n  <script src=\"app.js\"></script>\n</html>\n",
    )?;
    space.write("src/styles/main.scss", "@use \"colors\";\nh1 { color: navy; }\n")?;
    space.write("src/styles/_colors.scss", "$navy: #001f3f;\n")?;
    space.write("src/app.js", "console.log(1);  \n")?;
    Ok(())
}
