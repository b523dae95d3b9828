//! Build script: render the `kilnd(1)` manual page for packagers.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use time::OffsetDateTime;
use time::format_description::well_known::Iso8601;

const EPOCH_DATE: &str = "1970-01-01";

struct ManualPage {
    name: String,
    version: String,
    date: String,
}

impl ManualPage {
    fn file_name(&self) -> String {
        format!("{}.1", self.name)
    }

    fn render(&self) -> String {
        let Self {
            name,
            version,
            date,
        } = self;
        let title = name.to_uppercase();
        format!(
            ".TH \"{title}\" \"1\" \"{date}\" \"{name} {version}\" \"Kiln Compilation Server\"\n\
.SH NAME\n\
{name} \\- persistent compilation server\n\
.SH SYNOPSIS\n\
.B {name}\n\
[\\fIOPTIONS\\fR]\n\
.br\n\
.B {name} shutdown\n\
[\\fIOPTIONS\\fR]\n\
.SH DESCRIPTION\n\
{name} accepts connections from compiler clients, runs one build per\n\
connection through the configured compiler, and writes the result back.\n\
Builds whose client disconnects are cancelled.\n\
.SH OPTIONS\n\
.TP\n\
.B \\-\\-daemon\\-socket \\fIENDPOINT\\fR\n\
unix:///path or tcp://host:port to listen on.\n\
.TP\n\
.B \\-\\-compiler \\fIPATH\\fR\n\
Compiler executable run for each build.\n\
.TP\n\
.B \\-\\-keep\\-alive\\-secs \\fISECONDS\\fR\n\
Exit after this many idle seconds.\n\
.TP\n\
.B \\-\\-log\\-filter \\fIFILTER\\fR, \\-\\-log\\-format \\fIjson|compact\\fR\n\
Telemetry filter and output format.\n\
.SH ENVIRONMENT\n\
Every option may be set through a KILN_ prefixed variable, for example\n\
KILN_COMPILER.\n\
.SH EXIT STATUS\n\
0 after a clean shutdown, 1 after a failed exchange or launch error.\n"
        )
    }
}

/// Date stamped on the page, honouring reproducible-build timestamps.
fn manual_date() -> String {
    let Ok(raw) = env::var("SOURCE_DATE_EPOCH") else {
        return EPOCH_DATE.into();
    };
    let formatted = raw
        .parse::<i64>()
        .ok()
        .and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
        .and_then(|moment| moment.format(&Iso8601::DATE).ok());
    formatted.unwrap_or_else(|| {
        println!("cargo:warning=ignoring invalid SOURCE_DATE_EPOCH '{raw}'");
        EPOCH_DATE.into()
    })
}

/// `target/generated-man/<target>/<profile>`, located from `OUT_DIR`.
fn packaging_dir(out_dir: &Path) -> PathBuf {
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown-target".into());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown-profile".into());
    // OUT_DIR is target/<profile>/build/<crate>-<hash>/out.
    let target_root = out_dir
        .ancestors()
        .nth(4)
        .map_or_else(|| PathBuf::from("target"), Path::to_path_buf);
    target_root
        .join("generated-man")
        .join(target)
        .join(profile)
}

fn install(contents: &[u8], dir: &Path, file_name: &str) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let staged = dir.join(format!("{file_name}.tmp"));
    fs::write(&staged, contents)?;
    fs::rename(&staged, dir.join(file_name))
}

fn main() -> Result<(), Box<dyn Error>> {
    for variable in ["SOURCE_DATE_EPOCH", "TARGET", "PROFILE"] {
        println!("cargo:rerun-if-env-changed={variable}");
    }

    let page = ManualPage {
        name: env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "kilnd".into()),
        version: env::var("CARGO_PKG_VERSION")?,
        date: manual_date(),
    };
    let rendered = page.render();
    let file_name = page.file_name();

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR is not set")?);
    install(rendered.as_bytes(), &out_dir, &file_name)?;
    if let Err(error) = install(rendered.as_bytes(), &packaging_dir(&out_dir), &file_name) {
        println!("cargo:warning=failed to stage manual page for packaging: {error}");
    }
    Ok(())
}
