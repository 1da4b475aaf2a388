use crossdis_lib::{
    CodeObject, DisassembleOptions, Implementation, Version, disassemble_for, disassemble_to_string, registry,
};
use pretty_assertions::assert_eq;

const MODULE: &str = r#"{
    "name": "<module>",
    "code": "6500 6501 1700 5a02 6402 8400 5a03 6400 5300",
    "linetable": [4, 1, 6, 2],
    "names": ["a", "b", "c", "f"],
    "consts": [
        null,
        2.5,
        {"code": {
            "name": "f",
            "argcount": 1,
            "firstlineno": 4,
            "code": "7c00 6401 1400 5300",
            "varnames": ["x"],
            "consts": [null, 2]
        }}
    ]
}"#;

fn module() -> CodeObject {
    serde_json::from_str(MODULE).unwrap()
}

#[test]
fn parses_code_objects_from_json() {
    let code = module();
    assert_eq!(code.code.len(), 18);
    assert_eq!(code.linetable, vec![4, 1, 6, 2]);
    let nested: Vec<&str> = code.nested().map(|c| c.name.as_str()).collect();
    assert_eq!(nested, vec!["f"]);
}

#[test]
fn renders_module_and_nested_function() {
    let table = registry::get(Version::new(3, 8), Implementation::CPython).unwrap();
    let text = disassemble_to_string(&module(), &table, &DisassembleOptions::default()).unwrap();
    assert_eq!(
        text,
        concat!(
            "   1    00000 LOAD_NAME                0 (a)\n",
            "        00002 LOAD_NAME                1 (b)\n",
            "\n",
            "   2    00004 BINARY_ADD\n",
            "        00006 STORE_NAME               2 (c)\n",
            "        00008 LOAD_CONST               2 (<code object f>)\n",
            "\n",
            "   4    00010 MAKE_FUNCTION            0 (No arguments)\n",
            "        00012 STORE_NAME               3 (f)\n",
            "        00014 LOAD_CONST               0 (None)\n",
            "        00016 RETURN_VALUE\n",
            "\n",
            "Disassembly of <code object f>:\n",
            "   4    00000 LOAD_FAST                0 (x)\n",
            "        00002 LOAD_CONST               1 (2)\n",
            "        00004 BINARY_MULTIPLY\n",
            "        00006 RETURN_VALUE\n",
        )
    );
}

#[test]
fn extended_rendering_of_nested_function() {
    let table = registry::get(Version::new(3, 8), Implementation::CPython).unwrap();
    let options = DisassembleOptions { extended: true, ..Default::default() };
    let text = disassemble_to_string(&module(), &table, &options).unwrap();
    assert!(text.contains("00004 BINARY_ADD           TOS = a + b\n"), "{text}");
    assert!(text.contains("00006 STORE_NAME               2 (c) ; c = a + b\n"), "{text}");
    assert!(text.contains("00004 BINARY_MULTIPLY      TOS = x * 2\n"), "{text}");
    assert!(text.contains("00006 RETURN_VALUE         return x * 2\n"), "{text}");
}

#[test]
fn disassembly_serializes_to_json() {
    let options = DisassembleOptions::default();
    let dis = disassemble_for(&module(), Version::new(3, 8), Implementation::CPython, &options).unwrap();
    let value = serde_json::to_value(&dis).unwrap();
    assert_eq!(value["name"], "<module>");
    assert_eq!(value["table"]["version"]["minor"], 8);
    assert_eq!(value["table"]["implementation"], "cpython");
    assert_eq!(value["code"], "6500650117005a0264028400 5a0364005300".replace(' ', ""));
    assert_eq!(value["instructions"][0]["opname"], "LOAD_NAME");
    assert_eq!(value["instructions"][0]["argrepr"], "a");
    assert_eq!(value["instructions"][1]["starts_line"], serde_json::Value::Null);
    assert_eq!(value["instructions"][2]["stack_effect"], -1);
    assert_eq!(value["children"][0]["name"], "f");
    assert!(value.get("annotations").is_none());
    assert!(value["faults"].as_array().unwrap().is_empty());
}

#[test]
fn options_round_trip_through_json() {
    let options: DisassembleOptions =
        serde_json::from_str(r#"{"show_caches": true, "extended": false, "dup_lines": true}"#).unwrap();
    assert!(options.show_caches && options.dup_lines && !options.extended);
    assert_eq!(
        serde_json::to_string(&DisassembleOptions::default()).unwrap(),
        r#"{"show_caches":false,"extended":false,"dup_lines":false}"#
    );
}

#[test]
fn unknown_versions_are_reported() {
    let options = DisassembleOptions::default();
    let err = disassemble_for(&module(), Version::new(1, 5), Implementation::CPython, &options).unwrap_err();
    assert!(err.to_string().contains("no opcode table"), "{err}");
}
