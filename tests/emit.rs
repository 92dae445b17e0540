mod support;

use std::fs;

use support::wasm;
use wasm2cs::{kind_of, render, translate, Config, TranslateError, UnitKind};

fn functions(count: usize) -> Vec<u8> {
    let body = "(func (param i32) (result i32) local.get 0 i32.const 1 i32.add)";
    wasm(&format!("(module {})", body.repeat(count)))
}

#[test]
fn groups_split_into_fixed_size_units() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .out_dir(dir.path())
        .group_size(64)
        .runtime_support(false);
    let paths = translate(&functions(130), &config).unwrap();
    let names: Vec<_> = paths
        .iter()
        .map(|path| path.file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(
        names,
        [
            "Inst.Exports.cs",
            "Inst.Funcs0.cs",
            "Inst.Funcs1.cs",
            "Inst.Funcs2.cs",
            "Inst.Init.cs",
        ]
    );

    let counts: Vec<_> = ["Inst.Funcs0.cs", "Inst.Funcs1.cs", "Inst.Funcs2.cs"]
        .iter()
        .map(|name| {
            let text = fs::read_to_string(dir.path().join(name)).unwrap();
            text.matches("private int f").count()
        })
        .collect();
    assert_eq!(counts, [64, 64, 2]);
}

#[test]
fn runtime_support_adds_two_units() {
    let units = render(&functions(3), &Config::default()).unwrap();
    let kinds: Vec<_> = units.iter().map(|unit| unit.kind).collect();
    assert_eq!(
        kinds,
        [
            UnitKind::Functions(0),
            UnitKind::Exports,
            UnitKind::Bootstrap,
            UnitKind::Memory,
            UnitKind::Imports,
        ]
    );
    let memory = &units[3].contents;
    assert!(memory.contains("sealed class Mem"));
    assert!(memory.contains("static class Numerics"));
    let imports = &units[4].contents;
    assert!(imports.contains("interface IHost"));
    assert!(imports.contains("sealed class Import : IImport"));
}

#[test]
fn unresolved_import_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let bytes = wasm(
        r#"(module
            (import "env" "missing" (func $missing (param i32)))
            (func (export "run") i32.const 0 call $missing))"#,
    );
    let error = translate(&bytes, &Config::default().out_dir(&out)).unwrap_err();
    match kind_of(&error) {
        Some(TranslateError::UnresolvedImport { module, name }) => {
            assert_eq!(module, "env");
            assert_eq!(name, "missing");
        }
        other => panic!("expected an unresolved import, got {other:?}"),
    }
    assert!(!out.exists());
}

#[test]
fn override_supplies_the_import_body() {
    let bytes = wasm(
        r#"(module
            (import "env" "log" (func $log (param i32)))
            (func (export "run") i32.const 0 call $log))"#,
    );
    let config = Config::default().override_import("env.log", "Console.WriteLine(local0);\n");
    let units = render(&bytes, &config).unwrap();
    let imports = units
        .iter()
        .find(|unit| unit.kind == UnitKind::Imports)
        .unwrap();
    assert!(imports.contents.contains("// env.log (override)"));
    assert!(imports.contents.contains("public void env_log(int local0)"));
    assert!(imports.contents.contains("Console.WriteLine(local0);"));
    let funcs = &units[0].contents;
    assert!(funcs.contains("import_.env_log(s0_i32);"));
}

#[test]
fn output_is_stable_across_runs() {
    let bytes = wasm(
        r#"(module
            (import "go" "debug" (func $debug (param i32)))
            (memory 1)
            (data (i32.const 0) "go")
            (table 2 funcref)
            (elem (i32.const 1) $id)
            (func $id (param i32) (result i32) local.get 0)
            (func (export "run") (param i32)
                local.get 0
                local.get 0
                call_indirect (param i32) (result i32)
                call $debug))"#,
    );
    let config = Config::default().group_size(1).threads(4);
    let first = render(&bytes, &config).unwrap();
    let second = render(&bytes, &config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn indirect_add_emits_a_checked_dispatch() {
    let bytes = wasm(
        r#"(module
            (type $bin (func (param i32 i32) (result i32)))
            (table 1 funcref)
            (elem (i32.const 0) $add)
            (func $add (type $bin) local.get 0 local.get 1 i32.add)
            (func (export "main") (result i32)
                i32.const 2
                i32.const 3
                i32.const 0
                call_indirect (type $bin)))"#,
    );
    let units = render(&bytes, &Config::default().namespace("Go.Demo")).unwrap();
    let funcs = &units[0].contents;
    assert!(funcs.starts_with("// Code generated by wasm2cs. DO NOT EDIT."));
    assert!(funcs.contains("namespace Go.Demo"));
    assert!(funcs.contains("s0_i32 = s0_i32 + s1_i32;"));
    assert!(funcs.contains("s0_i32 = indirect_Type0(0, s2_i32)(s0_i32, s1_i32);"));

    let exports = &units[1].contents;
    assert!(exports.contains("public int main() => f1_();"));

    let init = &units[2].contents;
    assert!(init.contains("private delegate int Type0(int local0, int local1);"));
    assert!(init.contains("(Type0)f0_,"));
    assert!(init.contains("new uint?[] { 0 },"));
    assert!(init.contains("throw new TrapException(\"indirect call type mismatch\");"));
}

#[test]
fn unwritable_output_is_an_emission_failure() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("taken");
    fs::write(&file, "not a directory").unwrap();
    let error = translate(&functions(1), &Config::default().out_dir(&file)).unwrap_err();
    assert!(matches!(
        kind_of(&error),
        Some(TranslateError::EmissionIoFailure { .. })
    ));
}

#[test]
fn invalid_config_is_rejected() {
    let error = render(&functions(1), &Config::default().group_size(0)).unwrap_err();
    assert!(kind_of(&error).is_none());
    assert!(error.to_string().contains("group size"));
}
