//! Integration tests for the apply command.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod common;

use common::TestEnvBuilder;
use dotstate::error::SourceError;
use pretty_assertions::assert_eq;

#[test]
fn private_file_is_created_with_owner_only_mode() {
    let env = TestEnvBuilder::new()
        .with_source_file("private_dot_bashrc", "# bashrc\n")
        .build();

    assert_eq!(env.status(), vec![" A .bashrc".to_string()]);
    assert_eq!(env.apply(), vec![".bashrc".to_string()]);
    assert_eq!(env.read_dest(".bashrc"), "# bashrc\n");
    #[cfg(unix)]
    assert_eq!(env.dest_mode(".bashrc"), 0o600);
}

#[test]
fn exact_dir_removes_unmanaged_entries() {
    let env = TestEnvBuilder::new()
        .with_source_file("exact_dot_config/private_dot_bashrc", "x\n")
        .with_dest_file(".config/stale", "old\n")
        .build();

    env.apply();

    assert_eq!(env.read_dest(".config/.bashrc"), "x\n");
    assert!(!env.dest().join(".config/stale").exists());
}

#[test]
fn second_apply_changes_nothing() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_profile", "export A=1\n")
        .with_source_file("dot_config/app/config.toml", "k = 1\n")
        .with_source_file("dot_local/bin/executable_tool", "#!/bin/sh\n")
        .build();

    assert!(!env.apply().is_empty());
    assert!(env.status().is_empty(), "{:?}", env.status());
    assert!(env.apply().is_empty());
}

#[test]
fn modified_destination_shows_as_changed() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_profile", "export A=1\n")
        .build();
    env.apply();
    env.write_dest(".profile", "export A=2\n");

    assert_eq!(env.status(), vec!["MM .profile".to_string()]);
    env.apply();
    assert_eq!(env.read_dest(".profile"), "export A=1\n");
}

#[test]
fn create_keeps_existing_contents() {
    let env = TestEnvBuilder::new()
        .with_source_file("create_dot_hushlogin", "default\n")
        .with_dest_file(".hushlogin", "mine\n")
        .build();

    assert!(env.status().is_empty());
    env.apply();
    assert_eq!(env.read_dest(".hushlogin"), "mine\n");
}

#[test]
fn remove_prefix_and_remove_file_delete_targets() {
    let env = TestEnvBuilder::new()
        .with_source_file("remove_dot_old", "")
        .with_source_file(".dotstateremove", ".cache-*\n")
        .with_dest_file(".old", "x")
        .with_dest_file(".cache-a", "x")
        .with_dest_file(".keep", "x")
        .build();

    env.apply();

    assert!(!env.dest().join(".old").exists());
    assert!(!env.dest().join(".cache-a").exists());
    assert!(env.dest().join(".keep").exists());
}

#[test]
fn ignored_entries_are_not_applied() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_a", "a")
        .with_source_file("dot_b", "b")
        .with_source_file(".dotstateignore", ".b\n")
        .build();

    assert_eq!(env.apply(), vec![".a".to_string()]);
    assert!(!env.dest().join(".b").exists());
}

#[test]
fn templates_see_config_data() {
    let env = TestEnvBuilder::new()
        .with_config("[data]\nemail = \"me@example.com\"\n")
        .with_source_file("dot_gitconfig.tmpl", "[user]\n\temail = {{ .email }}\n")
        .build();

    env.apply();

    assert_eq!(env.read_dest(".gitconfig"), "[user]\n\temail = me@example.com\n");
}

#[test]
fn empty_template_output_removes_target() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_optional.tmpl", "{{ if .enabled }}on{{ end }}")
        .with_config("[data]\nenabled = false\n")
        .with_dest_file(".optional", "stale")
        .build();

    env.apply();

    assert!(!env.dest().join(".optional").exists());
}

#[cfg(unix)]
#[test]
fn symlinks_point_at_their_contents() {
    let env = TestEnvBuilder::new()
        .with_source_file("symlink_dot_vimrc", ".config/nvim/init.vim\n")
        .build();

    env.apply();

    let link = std::fs::read_link(env.dest().join(".vimrc")).unwrap();
    assert_eq!(link, std::path::PathBuf::from(".config/nvim/init.vim"));
    assert!(env.status().is_empty());
}

#[cfg(unix)]
#[test]
fn modify_script_rewrites_existing_contents() {
    let env = TestEnvBuilder::new()
        .with_source_file("modify_dot_profile", "#!/bin/sh\ntr a-z A-Z\n")
        .with_dest_file(".profile", "export a=1\n")
        .build();

    env.apply();

    assert_eq!(env.read_dest(".profile"), "EXPORT A=1\n");
}

#[cfg(unix)]
#[test]
fn run_once_script_runs_once_per_content() {
    let env = TestEnvBuilder::new().build();
    let log = env.root.path().join("script.log");
    let script = |word: &str| format!("#!/bin/sh\necho {word} >> '{}'\n", log.display());
    env.write_source("run_once_before_setup.sh", &script("first"));

    assert_eq!(env.status(), vec![" R setup.sh".to_string()]);
    env.apply();
    env.apply();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\n");
    assert!(env.status().is_empty());

    env.write_source("run_once_before_setup.sh", &script("second"));
    env.apply();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
}

#[cfg(unix)]
#[test]
fn run_onchange_script_reruns_only_when_changed() {
    let env = TestEnvBuilder::new().build();
    let log = env.root.path().join("script.log");
    let script = |word: &str| format!("#!/bin/sh\necho {word} >> '{}'\n", log.display());
    env.write_source("run_onchange_after_packages.sh", &script("v1"));

    env.apply();
    env.apply();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "v1\n");

    env.write_source("run_onchange_after_packages.sh", &script("v2"));
    env.apply();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "v1\nv2\n");
}

#[cfg(unix)]
#[test]
fn plain_run_script_runs_every_time() {
    let env = TestEnvBuilder::new().build();
    let log = env.root.path().join("script.log");
    env.write_source(
        "run_hello.sh",
        &format!("#!/bin/sh\necho hi >> '{}'\n", log.display()),
    );

    env.apply();
    env.apply();

    assert_eq!(std::fs::read_to_string(&log).unwrap(), "hi\nhi\n");
}

#[test]
fn conflicting_sources_are_reported() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_a", "one")
        .with_source_file("private_dot_a", "two")
        .build();

    let err = env.try_apply(&[]).unwrap_err();

    let source_err = err.downcast_ref::<SourceError>().unwrap();
    assert!(matches!(source_err, SourceError::Inconsistent(_)), "{err:#}");
    assert_eq!(
        source_err.to_string(),
        ".a: inconsistent state (dot_a, private_dot_a)"
    );
    assert!(!env.dest().join(".a").exists());
}

#[test]
fn newer_source_version_is_refused() {
    let env = TestEnvBuilder::new()
        .with_source_file(".dotstateversion", "99.0.0\n")
        .with_source_file("dot_a", "a")
        .build();

    let err = env.try_apply(&[]).unwrap_err();

    assert!(
        matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::TooOld { need, .. }) if need.major == 99
        ),
        "{err:#}"
    );
}

#[test]
fn type_filter_limits_what_is_applied() {
    let env = TestEnvBuilder::new()
        .with_source_file("dot_a", "a")
        .with_source_dir("dot_dir")
        .with_flags(&["--include", "dirs"])
        .build();

    env.apply();

    assert!(env.dest().join(".dir").is_dir());
    assert!(!env.dest().join(".a").exists());
}

#[test]
fn sequential_and_parallel_walks_agree() {
    let build = |flags: &[&str]| {
        TestEnvBuilder::new()
            .with_source_file("dot_a", "a")
            .with_source_file("dot_b/c", "c")
            .with_source_file("dot_b/dot_d/e", "e")
            .with_source_file("dot_f/g", "g")
            .with_flags(flags)
            .build()
    };
    let sequential = build(&["--no-parallel"]);
    let parallel = build(&[]);

    assert_eq!(sequential.status(), parallel.status());
    assert_eq!(sequential.apply(), parallel.apply());
}
