use std::{env, fs, path::PathBuf};

use anyhow::{anyhow, Context as _};
use aya_build::Toolchain;

const EBPF_PACKAGE: &str = "procevents-ebpf";
const ARTIFACT_NAME: &str = "procevents";

fn main() -> anyhow::Result<()> {
    if let Err(e) = build_artifact() {
        // The agent still builds and its tests still run; startup then fails
        // with a load error because the embedded object is empty.
        println!("cargo:warning=eBPF artifact not built ({e:#}); embedding an empty object");
        let out_dir = PathBuf::from(env::var("OUT_DIR").context("OUT_DIR not set")?);
        let artifact = out_dir.join(ARTIFACT_NAME);
        if !artifact.exists() {
            fs::write(&artifact, []).with_context(|| format!("writing {}", artifact.display()))?;
        }
    }
    Ok(())
}

fn build_artifact() -> anyhow::Result<()> {
    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = ebpf_package;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;
    let ebpf_package = aya_build::Package {
        name: name.as_str(),
        root_dir: root_dir.as_str(),
        ..Default::default()
    };
    aya_build::build_ebpf([ebpf_package], Toolchain::default())
}
