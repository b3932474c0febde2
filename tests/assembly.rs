use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use report_assembler::assembly::{list_placeholders, roundtrip, work_dir_for, RowAppend};
use report_assembler::automation::{AutomationGate, AutomationOp, OfficeAutomation};
use report_assembler::docx::package::read_entries;
use report_assembler::docx::placeholder::PlaceholderMap;
use report_assembler::docx::table::TableSelector;
use report_assembler::fields::{HeadingTaxonomy, PresenceSet};
use report_assembler::prune::heading::{HeadingLevel, SectionTarget};
use report_assembler::prune::table::TablePruneSpec;
use report_assembler::{Assembler, AssemblyError, AssemblyOptions, AssemblyRequest};

const PNG: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 1, 2, 3];

const STYLES: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    "\n",
    r#"<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    r#"<w:style w:type="paragraph" w:styleId="1"><w:name w:val="heading 1"/></w:style>"#,
    r#"<w:style w:type="paragraph" w:styleId="2"><w:name w:val="heading 2"/></w:style>"#,
    "</w:styles>",
);

const HEADER: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    "\n",
    r#"<w:hdr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    "<w:p><w:r><w:t>{{project_name}} / {{project_model}}</w:t></w:r></w:p></w:hdr>",
);

const SETTINGS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    "\n",
    r#"<w:settings xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    r#"<w:zoom w:percent="100"/><w:defaultTabStop w:val="420"/>"#,
    r#"<w:compat><w:compatSetting w:name="compatibilityMode" w:val="15"/></w:compat>"#,
    "</w:settings>",
);

fn heading(style: &str, text: &str) -> String {
    format!(
        r#"<w:p><w:pPr><w:pStyle w:val="{style}"/></w:pPr><w:r><w:t>{text}</w:t></w:r></w:p>"#
    )
}

fn para(text: &str) -> String {
    format!("<w:p><w:r><w:t>{text}</w:t></w:r></w:p>")
}

fn table(grid: usize, rows: &[&[&str]]) -> String {
    let cols: String = (0..grid).map(|_| r#"<w:gridCol w:w="1500"/>"#).collect();
    let body: String = rows
        .iter()
        .map(|r| {
            let cells: String = r
                .iter()
                .map(|c| {
                    let props = r#"<w:tcPr><w:tcW w:w="1500" w:type="dxa"/></w:tcPr>"#;
                    format!("<w:tc>{props}{}</w:tc>", para(c))
                })
                .collect();
            format!("<w:tr>{cells}</w:tr>")
        })
        .collect();
    format!("<w:tbl><w:tblPr/><w:tblGrid>{cols}</w:tblGrid>{body}</w:tbl>")
}

fn document_xml() -> String {
    let body = [
        heading("1", "A"),
        para("型号：{{project_model}}"),
        heading("1", "B"),
        para("b body"),
        heading("2", "B.1"),
        para("b.1 body"),
        heading("1", "C"),
        para("重量：{{weight}}"),
        table(
            2,
            &[
                &["项目", "要求"],
                &["电源部分", ""],
                &["输入电压", "28V"],
                &["信号部分", ""],
                &["接口", "RS422"],
                &["输出", "TTL"],
                &["电源输入特性", ""],
                &["纹波", "10mV"],
            ],
        ),
        table(3, &[&["序号", "名称", "数量"]]),
    ]
    .concat();
    let sect = r#"<w:sectPr><w:pgSz w:w="11906" w:h="16838"/></w:sectPr>"#;
    format!(
        "{}\n{}<w:body>{body}{sect}</w:body></w:document>",
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
    )
}

fn write_template(path: &Path) {
    let f = std::fs::File::create(path).unwrap();
    let mut z = ZipWriter::new(f);
    let deflate = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let document = document_xml();
    let entries: [(&str, &[u8], SimpleFileOptions); 7] = [
        ("word/settings.xml", SETTINGS.as_bytes(), deflate),
        ("[Content_Types].xml", b"<Types/>", deflate),
        ("_rels/.rels", b"<Relationships/>", deflate),
        ("word/document.xml", document.as_bytes(), deflate),
        ("word/styles.xml", STYLES.as_bytes(), deflate),
        ("word/header1.xml", HEADER.as_bytes(), deflate),
        ("word/media/image1.png", PNG, stored),
    ];
    for (name, data, opts) in entries {
        z.start_file(name, opts).unwrap();
        z.write_all(data).unwrap();
    }
    z.finish().unwrap();
}

fn entry(path: &Path, name: &str) -> Vec<u8> {
    read_entries(path)
        .unwrap()
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, d)| d)
        .unwrap_or_else(|| panic!("{name} missing from {}", path.display()))
}

fn entry_text(path: &Path, name: &str) -> String {
    String::from_utf8(entry(path, name)).unwrap()
}

fn no_automation() -> AssemblyOptions {
    AssemblyOptions {
        recalculate_toc: false,
        ..AssemblyOptions::default()
    }
}

fn base_request(template: &Path, output: PathBuf, model: &str) -> AssemblyRequest {
    let mut placeholders = PlaceholderMap::new();
    placeholders.insert_code("project_model", model);
    placeholders.insert_code("project_name", "滤波器 & <组件>");
    placeholders.insert_code("weight", "1.2kg");
    AssemblyRequest {
        template: template.to_path_buf(),
        output,
        placeholders,
        ..AssemblyRequest::default()
    }
}

#[test]
fn roundtrip_preserves_every_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("copy.docx");

    roundtrip(&template, &out).unwrap();
    assert_eq!(read_entries(&out).unwrap(), read_entries(&template).unwrap());
    assert!(!work_dir_for(&out).exists());
}

#[test]
fn full_run_substitutes_prunes_and_appends() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let dims = tmp.path().join("dim_01.png");
    std::fs::write(&dims, b"new image bytes").unwrap();
    let out = tmp.path().join("out/MTLB32B_spec.docx");

    let mut req = base_request(&template, out.clone(), "MTLB32B");
    req.sections = vec![SectionTarget::new("B", HeadingLevel::Primary)];
    req.images = vec![("image1.png".to_string(), dims.clone())];
    req.table_prunes = vec![TablePruneSpec {
        table: TableSelector::Index(0),
        headings: vec!["电源部分".into(), "信号部分".into(), "电源输入特性".into()],
        missing: vec!["信号部分".into()],
        fields: Default::default(),
    }];
    req.row_appends = vec![RowAppend {
        table: TableSelector::Header("序号".into()),
        rows: vec![
            vec!["电源滤波组件".into(), "1套".into()],
            vec!["安装支架".into(), "2件".into()],
        ],
    }];

    let report = Assembler::new(no_automation(), None).assemble(&req).unwrap();
    assert_eq!(report.output, out);
    assert!(!work_dir_for(&out).exists());

    let doc = entry_text(&out, "word/document.xml");
    assert!(doc.contains("型号：MTLB32B"));
    assert!(doc.contains("重量：1.2kg"));
    assert!(!doc.contains("{{"));
    assert!(!doc.contains("b body") && !doc.contains("B.1"));
    assert!(doc.contains(">A<") && doc.contains(">C<"));
    assert!(doc.contains("<w:pgSz"), "section properties must survive");

    let header = entry_text(&out, "word/header1.xml");
    assert!(header.contains("滤波器 &amp; &lt;组件&gt; / MTLB32B"));

    assert_eq!(report.sections.removed, ["B"]);
    assert_eq!(report.tables[0].original_rows, 8);
    assert_eq!(report.tables[0].removed_rows, 3);
    assert_eq!(report.tables[0].retained_rows, 5);
    assert!(!doc.contains("RS422") && doc.contains("纹波"));

    assert_eq!(report.rows, [vec!["1.".to_string(), "2.".to_string()]]);
    assert!(doc.contains("电源滤波组件") && doc.contains("2件"));

    assert_eq!(report.images.replaced, ["image1.png"]);
    assert_eq!(entry(&out, "word/media/image1.png"), b"new image bytes");

    let names: Vec<String> = read_entries(&out).unwrap().into_iter().map(|(n, _)| n).collect();
    let want: Vec<String> = read_entries(&template).unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, want);
}

#[test]
fn bad_image_slots_leave_the_package_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let src = tmp.path().join("x.png");
    std::fs::write(&src, b"x").unwrap();
    let out = tmp.path().join("out.docx");

    let mut req = base_request(&template, out.clone(), "M");
    req.images = vec![
        ("../document.xml".to_string(), src.clone()),
        ("image9.png".to_string(), src.clone()),
        ("image1.png".to_string(), tmp.path().join("missing.png")),
    ];
    let report = Assembler::new(no_automation(), None).assemble(&req).unwrap();
    assert!(report.images.replaced.is_empty());
    assert_eq!(report.images.skipped.len(), 3);
    assert_eq!(entry(&out, "word/media/image1.png"), PNG);
    assert_eq!(read_entries(&out).unwrap().len(), read_entries(&template).unwrap().len());
}

#[test]
fn required_field_without_data_fails_before_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("out.docx");

    let mut req = base_request(&template, out.clone(), "M");
    req.taxonomy = serde_json::from_str(
        r#"[{"title": "C", "level": "primary", "field": "weight", "prunable": false}]"#,
    )
    .unwrap();
    let err = Assembler::new(no_automation(), None).assemble(&req).unwrap_err();
    assert!(matches!(err, AssemblyError::PartialDataError { ref field, .. } if field == "weight"));
    assert!(!out.exists());
    assert!(!work_dir_for(&out).exists());
}

#[test]
fn missing_fields_prune_their_sections() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("out.docx");

    let mut req = base_request(&template, out.clone(), "M");
    let taxonomy: HeadingTaxonomy = serde_json::from_str(
        r#"[{"title": "B.1", "level": "secondary", "field": "circuit"},
            {"title": "A", "level": "primary", "field": "weight"}]"#,
    )
    .unwrap();
    req.taxonomy = taxonomy;
    let mut presence = PresenceSet::default();
    presence.insert("weight");
    req.presence = presence;

    let report = Assembler::new(no_automation(), None).assemble(&req).unwrap();
    assert_eq!(report.sections.removed, ["B.1"]);
    assert!(!report.fields_marked_dirty);
    let doc = entry_text(&out, "word/document.xml");
    assert!(!doc.contains("b.1 body"));
    assert!(doc.contains("b body") && doc.contains(">A<"));
}

#[test]
fn missing_fields_prune_their_table_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("out.docx");

    let mut req = base_request(&template, out.clone(), "M");
    req.table_prunes = vec![TablePruneSpec {
        table: TableSelector::Index(0),
        headings: vec!["电源部分".into(), "信号部分".into(), "电源输入特性".into()],
        missing: Vec::new(),
        fields: [
            ("电源部分", "power"),
            ("信号部分", "signal"),
            ("电源输入特性", "power_input"),
        ]
        .into_iter()
        .map(|(h, f)| (h.to_string(), f.to_string()))
        .collect(),
    }];
    let mut presence = PresenceSet::default();
    presence.insert("power");
    presence.insert("power_input");
    req.presence = presence;

    let report = Assembler::new(no_automation(), None).assemble(&req).unwrap();
    assert_eq!(report.tables[0].removed_rows, 3);
    assert_eq!(report.tables[0].retained_rows, 5);
    let doc = entry_text(&out, "word/document.xml");
    assert!(!doc.contains("信号部分") && !doc.contains("RS422") && !doc.contains("TTL"));
    assert!(doc.contains("输入电压") && doc.contains("纹波"));
}

#[test]
fn unknown_table_is_lenient_unless_strict() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("out.docx");

    let mut req = base_request(&template, out.clone(), "M");
    req.row_appends = vec![RowAppend {
        table: TableSelector::Index(7),
        rows: vec![vec!["x".into()]],
    }];
    let report = Assembler::new(no_automation(), None).assemble(&req).unwrap();
    assert_eq!(report.missing_tables, ["index 7"]);

    let strict = AssemblyOptions {
        strict_tables: true,
        ..no_automation()
    };
    let err = Assembler::new(strict, None).assemble(&req).unwrap_err();
    assert!(matches!(err, AssemblyError::TableNotFound(_)));
}

#[test]
fn concurrent_runs_match_sequential_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let assembler = Assembler::new(no_automation(), None);
    let models = ["M1", "M2", "M3", "M4"];

    let request = |dir: &str, model: &str| {
        let out = tmp.path().join(dir).join(format!("{model}.docx"));
        let mut req = base_request(&template, out, model);
        req.sections = vec![SectionTarget::new("B", HeadingLevel::Primary)];
        req
    };

    for model in models {
        assembler.assemble(&request("seq", model)).unwrap();
    }
    thread::scope(|s| {
        for model in models {
            let req = request("par", model);
            let assembler = &assembler;
            s.spawn(move || assembler.assemble(&req).unwrap());
        }
    });

    for model in models {
        let seq = read_entries(&tmp.path().join("seq").join(format!("{model}.docx"))).unwrap();
        let par = read_entries(&tmp.path().join("par").join(format!("{model}.docx"))).unwrap();
        assert_eq!(seq, par, "{model}");
        let (_, doc) = par
            .into_iter()
            .find(|(n, _)| n == "word/document.xml")
            .unwrap();
        let doc = String::from_utf8(doc).unwrap();
        assert!(doc.contains(&format!("型号：{model}")));
    }
}

#[test]
fn placeholders_are_listed_per_part() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);

    let found = list_placeholders(&template).unwrap();
    let doc: Vec<&str> = found["word/document.xml"].iter().map(String::as_str).collect();
    assert_eq!(doc, ["project_model", "weight"]);
    let header: Vec<&str> = found["word/header1.xml"].iter().map(String::as_str).collect();
    assert_eq!(header, ["project_model", "project_name"]);
    assert!(!found.contains_key("word/styles.xml"));
}

struct ScriptedOffice {
    calls: Arc<AtomicUsize>,
    fail_on: Option<&'static str>,
    recalculates: bool,
}

impl OfficeAutomation for ScriptedOffice {
    fn connect(&mut self) -> report_assembler::Result<()> {
        Ok(())
    }

    fn invoke(
        &mut self,
        op: &AutomationOp,
        document: &Path,
        _timeout: Duration,
    ) -> report_assembler::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(op.to_string().as_str()) {
            return Err(AssemblyError::ExternalOperationFailed(format!(
                "{op}: scripted failure"
            )));
        }
        match op {
            AutomationOp::RecalculateFields => Ok(document.to_path_buf()),
            AutomationOp::ExportPdf { out_dir } => {
                let stem = document.file_stem().unwrap().to_string_lossy().into_owned();
                let pdf = out_dir.join(format!("{stem}.pdf"));
                std::fs::write(&pdf, b"%PDF-1.7").unwrap();
                Ok(pdf)
            }
        }
    }

    fn close(&mut self) -> report_assembler::Result<()> {
        Ok(())
    }

    fn supports(&self, op: &AutomationOp) -> bool {
        self.recalculates || !matches!(op, AutomationOp::RecalculateFields)
    }
}

fn scripted_gate(
    calls: &Arc<AtomicUsize>,
    fail_on: Option<&'static str>,
    recalculates: bool,
) -> Arc<AutomationGate> {
    let client = ScriptedOffice {
        calls: Arc::clone(calls),
        fail_on,
        recalculates,
    };
    Arc::new(AutomationGate::new(Box::new(client), Duration::from_secs(30)))
}

fn gate(calls: &Arc<AtomicUsize>, fail_on: Option<&'static str>) -> Arc<AutomationGate> {
    scripted_gate(calls, fail_on, true)
}

#[test]
fn automation_runs_after_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("report.docx");
    let calls = Arc::new(AtomicUsize::new(0));

    let options = AssemblyOptions {
        export_pdf: true,
        ..AssemblyOptions::default()
    };
    let report = Assembler::new(options, Some(gate(&calls, None)))
        .assemble(&base_request(&template, out.clone(), "M"))
        .unwrap();
    assert!(report.toc_recalculated);
    assert!(report.fields_marked_dirty);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let pdf = report.pdf.unwrap();
    assert_eq!(pdf.file_name().unwrap(), "report.pdf");
    assert!(pdf.is_file());
    assert!(out.is_file());
}

#[test]
fn conversion_only_office_does_not_claim_recalculation() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("report.docx");
    let calls = Arc::new(AtomicUsize::new(0));

    let options = AssemblyOptions {
        export_pdf: true,
        ..AssemblyOptions::default()
    };
    let report = Assembler::new(options, Some(scripted_gate(&calls, None, false)))
        .assemble(&base_request(&template, out.clone(), "M"))
        .unwrap();
    assert!(!report.toc_recalculated);
    assert!(report.fields_marked_dirty);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(report.pdf.is_some());

    let settings = entry_text(&out, "word/settings.xml");
    let flag = settings.find(r#"<w:updateFields w:val="true"/>"#).unwrap();
    assert!(flag < settings.find("<w:compat>").unwrap());
}

#[test]
fn recalculation_off_leaves_settings_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("report.docx");

    let report = Assembler::new(no_automation(), None)
        .assemble(&base_request(&template, out.clone(), "M"))
        .unwrap();
    assert!(!report.fields_marked_dirty);
    assert_eq!(entry(&out, "word/settings.xml"), SETTINGS.as_bytes());
}

#[test]
fn automation_failure_removes_the_output() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("spec.docx");
    write_template(&template);
    let out = tmp.path().join("report.docx");
    let calls = Arc::new(AtomicUsize::new(0));

    let failing = gate(&calls, Some("recalculate fields"));
    let err = Assembler::new(AssemblyOptions::default(), Some(failing))
        .assemble(&base_request(&template, out.clone(), "M"))
        .unwrap_err();
    assert!(matches!(err, AssemblyError::ExternalOperationFailed(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!out.exists());
    assert!(!work_dir_for(&out).exists());
}

#[test]
fn corrupt_template_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let template = tmp.path().join("broken.docx");
    std::fs::write(&template, b"PK but not really").unwrap();
    let err = Assembler::new(no_automation(), None)
        .assemble(&base_request(&template, tmp.path().join("o.docx"), "M"))
        .unwrap_err();
    assert!(matches!(err, AssemblyError::ArchiveCorrupt { .. }));

    let missing = tmp.path().join("nope.docx");
    let err = Assembler::new(no_automation(), None)
        .assemble(&base_request(&missing, tmp.path().join("o.docx"), "M"))
        .unwrap_err();
    assert!(matches!(err, AssemblyError::TemplateMissing(_)));
}
