// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End to end: a midlet jar with one class goes through registration,
//! perform and artifact rewrite, and the instrumented class comes back out
//! of the postfixed archive.

use std::{fs::File, io::Read, io::Write, sync::Arc};

use tracedex_inject::{
    artifact::SilentReporter,
    injection::{Injection, InjectionPayload, InjectionTarget},
    mediator::{MethodKey, ModificationMediator},
};
use tracedex_models::models::{
    AttributeBody, CodeAttribute, ConstantPool, JvmAttribute, JvmClass, JvmMember,
};
use tracedex_parse::{context::ClassContext, session::AnalysisSession};
use zip::{write::FileOptions, ZipArchive, ZipWriter};

fn build_foo_class() -> Vec<u8> {
    let mut pool = ConstantPool::new();
    let this_class = pool.ensure_class("Foo");
    let super_class = pool.ensure_class("java/lang/Object");
    let name = pool.ensure_utf8("bar");
    let descriptor = pool.ensure_utf8("()V");
    let code_name = pool.ensure_utf8("Code");
    let class = JvmClass {
        minor_version: 0,
        major_version: 49,
        constant_pool: pool,
        access_flags: 0x21,
        this_class,
        super_class,
        interfaces: vec![],
        fields: vec![],
        methods: vec![JvmMember {
            access_flags: 0x1,
            name_index: name,
            descriptor_index: descriptor,
            attributes: vec![JvmAttribute {
                name_index: code_name,
                body: AttributeBody::Code(CodeAttribute {
                    max_stack: 1,
                    max_locals: 1,
                    // iconst_0, istore_0, return
                    code: vec![0x03, 0x3b, 0xb1],
                    exception_table: vec![],
                    attributes: vec![],
                }),
            }],
        }],
        attributes: vec![],
    };
    let mut bytes = vec![];
    class.write(&mut bytes).unwrap();
    bytes
}

#[test]
fn entry_injection_round_trips_through_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let jar_path = dir.path().join("app.jar");
    {
        let mut writer = ZipWriter::new(File::create(&jar_path).unwrap());
        writer
            .start_file("Foo.class", FileOptions::default())
            .unwrap();
        writer.write_all(&build_foo_class()).unwrap();
        writer.finish().unwrap();
    }

    let spec = jar_path.to_str().unwrap().to_string();
    let context: Arc<ClassContext> = ClassContext::open(&spec).unwrap();
    let mediator = ModificationMediator::new();
    let key = MethodKey::new("Foo", "bar", "()V");
    mediator.register_modification(
        &spec,
        key.clone(),
        Injection {
            target: InjectionTarget::MethodEntry,
            payload: InjectionPayload::PrintText("bar entered".to_string()),
        },
    );
    assert!(!mediator.is_modified(&spec, &key));

    let session = AnalysisSession::new();
    let artifact = mediator
        .perform_registered_modifications(&context, &session, &SilentReporter, "_traced")
        .unwrap()
        .expect("an artifact should have been written");
    assert_eq!(artifact, dir.path().join("app_traced.jar"));
    assert_eq!(mediator.modified_contexts(), vec![spec.clone()]);
    assert!(mediator.is_modified(&spec, &key));

    let mut archive = ZipArchive::new(File::open(&artifact).unwrap()).unwrap();
    let mut bytes = vec![];
    archive
        .by_name("Foo.class")
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    let class = JvmClass::read(&mut std::io::Cursor::new(bytes.as_slice())).unwrap();
    let code = class.methods[0].code().unwrap();
    // 9 payload bytes padded to 12, then the untouched original body
    assert_eq!(code.code.len(), 15);
    assert_eq!(code.code[0], 0xb2); // getstatic System.out
    assert_eq!(&code.code[12..], &[0x03, 0x3b, 0xb1]);

    // re-performing applies against the pristine original, same result
    let again = mediator
        .perform_registered_modifications(&context, &session, &SilentReporter, "_traced")
        .unwrap();
    assert!(again.is_some());

    mediator.unregister_modification(&spec, &key);
    assert!(mediator.modifications_for(&spec).is_empty());
    assert!(!mediator.is_modified(&spec, &key));

    mediator.unregister_modifications(&spec);
    assert!(mediator.modified_contexts().is_empty());
}
