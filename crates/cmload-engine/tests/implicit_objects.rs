//! Objects created on the fly for `<Link>` elements without a target:
//! reversal entries, phonological environments, external files, writing
//! systems, list items and lexical relations.

use cmload_engine::{DiagnosticKind, LoadConfig, LoadReport, Loader, XmlSource};
use cmload_schema::{core_catalog, FieldId, MetadataService, ObjectId, SchemaCatalog};
use cmload_store::{MemoryStore, ObjectStore, ScalarValue};
use std::fs;
use tempfile::tempdir;

fn field(catalog: &SchemaCatalog, class: &str, name: &str) -> FieldId {
    let class = catalog.class_id_for_name(class).expect("class exists");
    catalog.field_by_name(class, name).expect("field exists").id
}

fn objects(store: &MemoryStore, catalog: &SchemaCatalog, class: &str) -> Vec<ObjectId> {
    store.objects_of_class(catalog.class_id_for_name(class).expect("class exists"))
}

fn targets(store: &MemoryStore, source: ObjectId, field: FieldId) -> Vec<ObjectId> {
    store.references(source, field).into_iter().map(|r| r.target).collect()
}

/// A project declaring `en` and `fr` whose lexicon holds `entries`.
fn project(entries: &str) -> String {
    project_with("", "", entries)
}

/// Like [`project`], with `extra` fields on the project and `lex_db` fields
/// on the lexicon.
fn project_with(extra: &str, lex_db: &str, entries: &str) -> String {
    format!(
        r#"<FwDatabase>
  <LangProject>
    <WritingSystems6001>
      <LgWritingSystem><ICULocale24><Uni>en</Uni></ICULocale24></LgWritingSystem>
      <LgWritingSystem><ICULocale24><Uni>fr</Uni></ICULocale24></LgWritingSystem>
    </WritingSystems6001>
    {extra}
    <LexDb6001><LexDb>{lex_db}<Entries5005>{entries}</Entries5005></LexDb></LexDb6001>
  </LangProject>
</FwDatabase>"#
    )
}

fn texts(store: &MemoryStore, object: ObjectId, field: FieldId) -> Vec<String> {
    let mut texts: Vec<String> = store
        .multilingual_all(object, field)
        .into_iter()
        .map(|(_, t)| t.text)
        .collect();
    texts.sort();
    texts
}

fn load(
    store: &mut MemoryStore,
    catalog: &SchemaCatalog,
    config: LoadConfig,
    xml: String,
) -> LoadReport {
    Loader::new(store, catalog)
        .with_config(config)
        .load_full_database(&XmlSource::text("lexicon.xml", xml))
        .expect("load succeeds")
}

// ============================================================================
// Reversal entries
// ============================================================================

#[test]
fn test_reversal_paths_build_one_entry_tree() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = r#"
      <LexEntry><Senses5002>
        <LexSense><ReversalEntries5016>
          <Link ws="en" form="animal|dog"/>
          <Link ws="en" form="animal"/>
        </ReversalEntries5016></LexSense>
        <LexSense><ReversalEntries5016>
          <Link ws="en" form="animal|dog"/>
        </ReversalEntries5016></LexSense>
      </Senses5002></LexEntry>"#;
    load(&mut store, &catalog, LoadConfig::default(), project(entries));

    assert_eq!(objects(&store, &catalog, "ReversalIndex").len(), 1);
    let reversal = objects(&store, &catalog, "ReversalIndexEntry");
    assert_eq!(reversal.len(), 2, "animal and animal|dog");

    let index = objects(&store, &catalog, "ReversalIndex")[0];
    let top = store.owned_objects(index, field(&catalog, "ReversalIndex", "Entries"));
    assert_eq!(top.len(), 1);
    let animal = top[0];
    let subentries =
        store.owned_objects(animal, field(&catalog, "ReversalIndexEntry", "Subentries"));
    assert_eq!(subentries.len(), 1);
    let dog = subentries[0];

    let links = field(&catalog, "LexSense", "ReversalEntries");
    let senses = objects(&store, &catalog, "LexSense");
    let mut seen: Vec<Vec<ObjectId>> = senses.iter().map(|s| targets(&store, *s, links)).collect();
    seen.sort_by_key(|t| t.len());
    assert_eq!(seen[0], vec![dog]);
    assert_eq!(seen[1].len(), 2);
    assert!(seen[1].contains(&dog) && seen[1].contains(&animal));
}

// ============================================================================
// Phonological environments
// ============================================================================

#[test]
fn test_environment_forms_are_shared() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let allomorph = |form: &str| {
        format!(
            r#"<LexEntry><LexemeForm5002><MoStemAllomorph>
                 <Form5035><AUni ws="fr">{form}</AUni></Form5035>
                 <PhoneEnv5045><Link form="/ _ #"/></PhoneEnv5045>
               </MoStemAllomorph></LexemeForm5002></LexEntry>"#
        )
    };
    let entries = format!("{}{}", allomorph("chat"), allomorph("chien"));
    load(&mut store, &catalog, LoadConfig::default(), project(&entries));

    let environments = objects(&store, &catalog, "PhEnvironment");
    assert_eq!(environments.len(), 1);
    let env = environments[0];
    let representation = store
        .scalar(env, field(&catalog, "PhEnvironment", "StringRepresentation"))
        .and_then(|v| v.as_text().map(str::to_string));
    assert_eq!(representation.as_deref(), Some("/ _ #"));

    let phone_env = field(&catalog, "MoStemAllomorph", "PhoneEnv");
    for form in objects(&store, &catalog, "MoStemAllomorph") {
        assert_eq!(targets(&store, form, phone_env), vec![env]);
    }

    // The environment lives in the project's phonological data.
    let data = objects(&store, &catalog, "PhPhonData");
    assert_eq!(data.len(), 1);
    assert_eq!(
        store.owned_objects(data[0], field(&catalog, "PhPhonData", "Environments")),
        vec![env]
    );
}

// ============================================================================
// External files
// ============================================================================

fn picture(path: &str) -> String {
    format!(
        r#"<LexEntry><Senses5002><LexSense><Pictures5016>
             <CmPicture><PictureFile48><Link path="{path}"/></PictureFile48></CmPicture>
           </Pictures5016></LexSense></Senses5002></LexEntry>"#
    )
}

#[test]
fn test_picture_paths_become_files_in_the_picture_folder() {
    let dir = tempdir().expect("temp dir");
    fs::write(dir.path().join("cat.jpg"), b"jpeg").expect("write picture");
    let config = LoadConfig {
        base_import_dir: Some(dir.path().to_path_buf()),
        ..LoadConfig::default()
    };

    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let report = load(&mut store, &catalog, config, project(&picture("cat.jpg")));

    let files = objects(&store, &catalog, "CmFile");
    assert_eq!(files.len(), 1);
    let internal = store
        .scalar(files[0], field(&catalog, "CmFile", "InternalPath"))
        .and_then(|v| v.as_text().map(str::to_string));
    assert_eq!(
        internal,
        Some(dir.path().join("cat.jpg").to_string_lossy().into_owned())
    );

    let pic = objects(&store, &catalog, "CmPicture")[0];
    assert_eq!(targets(&store, pic, field(&catalog, "CmPicture", "PictureFile")), files);

    let project_id = objects(&store, &catalog, "LangProject")[0];
    let folders = store.owned_objects(project_id, field(&catalog, "LangProject", "Pictures"));
    assert_eq!(folders.len(), 1);
    let names = store.multilingual_all(folders[0], field(&catalog, "CmFolder", "Name"));
    assert_eq!(names[0].1.text, "Local Pictures");
    assert_eq!(report.diagnostic_count(DiagnosticKind::DataQuality), 0);
}

#[test]
fn test_missing_files_are_still_linked() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let report = load(
        &mut store,
        &catalog,
        LoadConfig::default(),
        project(&picture("/no/such/dir/owl.png")),
    );

    assert_eq!(objects(&store, &catalog, "CmFile").len(), 1);
    assert!(report.diagnostic_count(DiagnosticKind::DataQuality) >= 1);
}

// ============================================================================
// Writing systems
// ============================================================================

#[test]
fn test_unknown_writing_system_codes_are_created_once() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = r#"
      <LexEntry><CitationForm5002><AUni ws="qaa-x-kal">tuk</AUni></CitationForm5002></LexEntry>
      <LexEntry><CitationForm5002><AUni ws="qaa-x-kal">mak</AUni></CitationForm5002></LexEntry>"#;
    load(&mut store, &catalog, LoadConfig::default(), project(entries));

    let systems = objects(&store, &catalog, "LgWritingSystem");
    assert_eq!(systems.len(), 3, "en, fr and the new code");
    let project_id = objects(&store, &catalog, "LangProject")[0];
    let owned = store.owned_objects(project_id, field(&catalog, "LangProject", "WritingSystems"));
    assert_eq!(owned.len(), 3);

    let citation = field(&catalog, "LexEntry", "CitationForm");
    let used: Vec<ObjectId> = objects(&store, &catalog, "LexEntry")
        .into_iter()
        .flat_map(|e| store.multilingual_all(e, citation).into_iter().map(|(ws, _)| ws))
        .collect();
    assert_eq!(used.len(), 2);
    assert_eq!(used[0], used[1]);
}

// ============================================================================
// Duplicate reversal indexes
// ============================================================================

fn reversal_index(form: &str) -> String {
    format!(
        r#"<ReversalIndex>
             <WritingSystem5052><Link ws="en"/></WritingSystem5052>
             <Entries5052>
               <ReversalIndexEntry>
                 <ReversalForm5053><AUni ws="en">{form}</AUni></ReversalForm5053>
               </ReversalIndexEntry>
             </Entries5052>
           </ReversalIndex>"#
    )
}

#[test]
fn test_second_index_for_a_writing_system_folds_into_the_first() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let indexes = format!(
        "<ReversalIndexes5005>{}</ReversalIndexes5005>",
        reversal_index("cat")
    );
    let xml = project_with("", &indexes, "");
    load(&mut store, &catalog, LoadConfig::default(), xml);
    let survivor = objects(&store, &catalog, "ReversalIndex")[0];
    let lex_db = objects(&store, &catalog, "LexDb")[0];

    let doc = format!(
        "<FwDatabase><ReversalIndexes5005>{}</ReversalIndexes5005></FwDatabase>",
        reversal_index("dog")
    );
    let report = Loader::new(&mut store, &catalog)
        .import_multiple_fields_into_owner(&XmlSource::text("reversal.xml", doc), lex_db)
        .expect("import succeeds");

    assert_eq!(objects(&store, &catalog, "ReversalIndex"), vec![survivor]);
    let entries = store.owned_objects(survivor, field(&catalog, "ReversalIndex", "Entries"));
    assert_eq!(entries.len(), 2);
    let form = field(&catalog, "ReversalIndexEntry", "ReversalForm");
    let mut forms: Vec<String> = entries.iter().flat_map(|e| texts(&store, *e, form)).collect();
    forms.sort();
    assert_eq!(forms, vec!["cat".to_string(), "dog".to_string()]);
    assert!(report.diagnostic_count(DiagnosticKind::DataQuality) >= 1);
}

// ============================================================================
// List items
// ============================================================================

fn msa(body: &str) -> String {
    format!("<LexEntry><MorphoSyntaxAnalyses5002>{body}</MorphoSyntaxAnalyses5002></LexEntry>")
}

#[test]
fn test_affix_slots_live_under_the_named_part_of_speech() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let slot = msa(r#"<MoInflAffMsa><Slots5038>
        <Link ws="en" name="Tense" nameOwner="Verb"/>
      </Slots5038></MoInflAffMsa>"#);
    load(&mut store, &catalog, LoadConfig::default(), project(&format!("{slot}{slot}")));

    let pos = objects(&store, &catalog, "PartOfSpeech");
    assert_eq!(pos.len(), 1);
    assert_eq!(texts(&store, pos[0], field(&catalog, "CmPossibility", "Name")), vec!["Verb"]);

    let slots = objects(&store, &catalog, "MoInflAffixSlot");
    assert_eq!(slots.len(), 1);
    assert_eq!(
        store.owned_objects(pos[0], field(&catalog, "PartOfSpeech", "AffixSlots")),
        slots
    );
    assert_eq!(texts(&store, slots[0], field(&catalog, "MoInflAffixSlot", "Name")), vec!["Tense"]);

    let slot_refs = field(&catalog, "MoInflAffMsa", "Slots");
    let msas = objects(&store, &catalog, "MoInflAffMsa");
    assert_eq!(msas.len(), 2);
    for msa in msas {
        assert_eq!(targets(&store, msa, slot_refs), slots);
    }
}

#[test]
fn test_inflection_classes_match_by_abbreviation_under_their_owner() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let first = msa(r#"<MoStemMsa><InflectionClass5001>
        <Link ws="en" name="First" abbr="I" abbrOwner="N"/>
      </InflectionClass5001></MoStemMsa>"#);
    let again = msa(r#"<MoStemMsa><InflectionClass5001>
        <Link ws="en" abbr="i" abbrOwner="n"/>
      </InflectionClass5001></MoStemMsa>"#);
    load(&mut store, &catalog, LoadConfig::default(), project(&format!("{first}{again}")));

    let pos = objects(&store, &catalog, "PartOfSpeech");
    assert_eq!(pos.len(), 1, "the owner is found again by abbreviation");
    let classes = objects(&store, &catalog, "MoInflClass");
    assert_eq!(classes.len(), 1);
    assert_eq!(
        store.owned_objects(pos[0], field(&catalog, "PartOfSpeech", "InflectionClasses")),
        classes
    );
    assert_eq!(texts(&store, classes[0], field(&catalog, "MoInflClass", "Name")), vec!["First"]);
    assert_eq!(
        texts(&store, classes[0], field(&catalog, "MoInflClass", "Abbreviation")),
        vec!["I"]
    );

    let class_ref = field(&catalog, "MoStemMsa", "InflectionClass");
    for msa in objects(&store, &catalog, "MoStemMsa") {
        assert_eq!(targets(&store, msa, class_ref), classes);
    }
}

#[test]
fn test_new_items_take_vernacular_names() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entry = msa(r#"<MoStemMsa><PartOfSpeech5001>
        <Link ws="en" name="Noun" wsv="fr" namev="nom"/>
      </PartOfSpeech5001></MoStemMsa>"#);
    load(&mut store, &catalog, LoadConfig::default(), project(&entry));

    let pos = objects(&store, &catalog, "PartOfSpeech");
    assert_eq!(pos.len(), 1);
    assert_eq!(
        texts(&store, pos[0], field(&catalog, "CmPossibility", "Name")),
        vec!["Noun", "nom"]
    );
    assert_eq!(
        texts(&store, pos[0], field(&catalog, "CmPossibility", "Abbreviation")),
        vec!["Noun", "nom"]
    );
}

#[test]
fn test_swapped_matches_and_closed_lists_are_reported() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let domains = r#"
    <SemanticDomainList6001><CmPossibilityList>
      <IsClosed8><Boolean val="true"/></IsClosed8>
      <Possibilities8>
        <CmSemanticDomain>
          <Name7><AUni ws="en">Animal</AUni></Name7>
          <Abbreviation7><AUni ws="en">an</AUni></Abbreviation7>
        </CmSemanticDomain>
      </Possibilities8>
    </CmPossibilityList></SemanticDomainList6001>"#;
    let entry = r#"
      <LexEntry><Senses5002><LexSense><SemanticDomains5016>
        <Link ws="en" name="an"/>
        <Link ws="en" name="Plant"/>
      </SemanticDomains5016></LexSense></Senses5002></LexEntry>"#;
    let report = load(
        &mut store,
        &catalog,
        LoadConfig::default(),
        project_with(domains, "", entry),
    );

    let name = field(&catalog, "CmPossibility", "Name");
    let items = objects(&store, &catalog, "CmSemanticDomain");
    assert_eq!(items.len(), 2, "Plant is added despite the closed list");
    let animal = items
        .iter()
        .copied()
        .find(|d| texts(&store, *d, name) == vec!["Animal"])
        .expect("original item");

    let sense = objects(&store, &catalog, "LexSense")[0];
    let linked = targets(&store, sense, field(&catalog, "LexSense", "SemanticDomains"));
    assert_eq!(linked.len(), 2);
    assert!(linked.contains(&animal));
    assert_eq!(report.key_count("name-abbr-swapped"), 1);
    assert_eq!(report.key_count("closed-list"), 1);
}

// ============================================================================
// Lexical relations
// ============================================================================

fn headword(form: &str, relations: &str) -> String {
    format!(
        r#"<LexEntry>
             <CitationForm5002><AUni ws="fr">{form}</AUni></CitationForm5002>
             <LexEntryReferences>{relations}</LexEntryReferences>
           </LexEntry>"#
    )
}

fn entry_named(store: &MemoryStore, catalog: &SchemaCatalog, form: &str) -> ObjectId {
    let citation = field(catalog, "LexEntry", "CitationForm");
    objects(store, catalog, "LexEntry")
        .into_iter()
        .find(|e| texts(store, *e, citation) == vec![form.to_string()])
        .expect("entry exists")
}

/// Members of every stored relation, in stored order.
fn relations(store: &MemoryStore, catalog: &SchemaCatalog) -> Vec<Vec<ObjectId>> {
    let members = field(catalog, "LexReference", "Targets");
    objects(store, catalog, "LexReference")
        .into_iter()
        .map(|r| targets(store, r, members))
        .collect()
}

#[test]
fn test_pair_relations_from_both_ends_are_one_relation() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = format!(
        "{}{}",
        headword("grand", r#"<Link type="Antonym" mapping="pair" entry="petit"/>"#),
        headword("petit", r#"<Link type="Antonym" entry="grand"/>"#)
    );
    load(&mut store, &catalog, LoadConfig::default(), project(&entries));

    let grand = entry_named(&store, &catalog, "grand");
    let petit = entry_named(&store, &catalog, "petit");
    assert_eq!(relations(&store, &catalog), vec![vec![grand, petit]]);

    let types = objects(&store, &catalog, "LexRefType");
    assert_eq!(types.len(), 1);
    assert_eq!(
        store.scalar(types[0], field(&catalog, "LexRefType", "MappingType")),
        Some(ScalarValue::Integer(1))
    );
}

#[test]
fn test_reverse_names_join_the_forward_relation() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let types = r#"
    <References5005><CmPossibilityList><Possibilities8>
      <LexRefType>
        <Name7><AUni ws="en">Whole</AUni></Name7>
        <ReverseName5119><AUni ws="en">Part</AUni></ReverseName5119>
        <MappingType5119><Integer val="2"/></MappingType5119>
      </LexRefType>
    </Possibilities8></CmPossibilityList></References5005>"#;
    let entries = format!(
        "{}{}",
        headword("voiture", r#"<Link type="Whole" entry="roue"/>"#),
        headword("roue", r#"<Link type="Part" entry="voiture"/>"#)
    );
    load(&mut store, &catalog, LoadConfig::default(), project_with("", types, &entries));

    let voiture = entry_named(&store, &catalog, "voiture");
    let roue = entry_named(&store, &catalog, "roue");
    assert_eq!(relations(&store, &catalog), vec![vec![voiture, roue]]);
    assert_eq!(objects(&store, &catalog, "LexRefType").len(), 1);
}

#[test]
fn test_tree_relations_gather_dependents_under_the_head() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = format!(
        "{}{}{}{}",
        headword(
            "corps",
            r#"<Link type="Parts" mapping="tree" entry="bras"/><Link type="Parts" entry="jambe"/>"#
        ),
        headword("bras", ""),
        headword("jambe", ""),
        headword("tete", r#"<Link type="Parts" rev="1" entry="corps"/>"#)
    );
    load(&mut store, &catalog, LoadConfig::default(), project(&entries));

    let member = |form| entry_named(&store, &catalog, form);
    assert_eq!(
        relations(&store, &catalog),
        vec![vec![member("corps"), member("bras"), member("jambe"), member("tete")]]
    );
}

#[test]
fn test_sequence_relations_follow_positions_and_report_conflicts() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = format!(
        "{}{}{}{}",
        headword(
            "lundi",
            r#"<Link type="Week" mapping="sequence" entry="mercredi" ord="2"/>
               <Link type="Week" entry="mardi" ord="1"/>
               <Link type="Week" entry="jeudi" ord="2"/>"#
        ),
        headword("mardi", ""),
        headword("mercredi", ""),
        headword("jeudi", "")
    );
    let report = load(&mut store, &catalog, LoadConfig::default(), project(&entries));

    let member = |form| entry_named(&store, &catalog, form);
    assert_eq!(
        relations(&store, &catalog),
        vec![vec![member("lundi"), member("mardi"), member("mercredi")]]
    );
    assert_eq!(report.key_count("relation-conflict"), 1);
    assert!(report.diagnostic_count(DiagnosticKind::Unresolved) >= 1);
}

#[test]
fn test_new_members_go_after_the_highest_stored_position() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = format!(
        "{}{}{}",
        headword(
            "corps",
            r#"<Link type="Parts" mapping="tree" entry="bras"/><Link type="Parts" entry="jambe"/>"#
        ),
        headword("bras", ""),
        headword("jambe", "")
    );
    load(&mut store, &catalog, LoadConfig::default(), project(&entries));

    // Leave a gap at position 2.
    let members = field(&catalog, "LexReference", "Targets");
    let relation = objects(&store, &catalog, "LexReference")[0];
    let bras = entry_named(&store, &catalog, "bras");
    assert!(store.remove_reference(relation, members, bras).expect("remove"));

    let lex_db = objects(&store, &catalog, "LexDb")[0];
    let tete = headword("tete", r#"<Link type="Parts" rev="1" entry="corps"/>"#);
    let report = Loader::new(&mut store, &catalog)
        .import_object_into_field(
            &XmlSource::text("tete.xml", tete),
            lex_db,
            field(&catalog, "LexDb", "Entries"),
        )
        .expect("import succeeds");

    assert_eq!(report.diagnostic_count(DiagnosticKind::RowFailure), 0);
    assert_eq!(objects(&store, &catalog, "LexReference"), vec![relation]);
    let stored: Vec<(ObjectId, Option<u32>)> = store
        .references(relation, members)
        .into_iter()
        .map(|r| (r.target, r.ord))
        .collect();
    assert_eq!(
        stored,
        vec![
            (entry_named(&store, &catalog, "corps"), Some(1)),
            (entry_named(&store, &catalog, "jambe"), Some(3)),
            (entry_named(&store, &catalog, "tete"), Some(4)),
        ]
    );
}
