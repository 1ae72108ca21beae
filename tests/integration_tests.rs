//! Integration tests for the complete CmLoad pipeline
//!
//! These tests drive the public operations end to end:
//! - schema DSL → full load → store contents
//! - implicit list items, fabricated cross-reference targets
//! - list updates: merges, deletions, idempotence, conservation
//!
//! Run with: cargo test --test integration_tests

use cmload_engine::{DiagnosticKind, LoadError, Loader, XmlSource};
use cmload_schema::{core_catalog, ClassId, FieldId, MetadataService, ObjectId, SchemaCatalog};
use cmload_store::{MemoryStore, ObjectStore, ScalarValue};
use tempfile::tempdir;

const WIDGET_SCHEMA: &str = r#"
class CmObject = 0 abstract

class Widget = 100 : CmObject
  field Val = 100001 integer
  field Parts = 100002 owning sequence Part

class Part = 101 : CmObject
  field Label = 101001 unicode
"#;

const G_WIDGET: &str = "5a3c1e0f-0000-4000-8000-000000000001";
const G_PART: &str = "5a3c1e0f-0000-4000-8000-000000000002";
const G_EN: &str = "00000000-0000-4000-8000-0000000000e1";
const G_FR: &str = "00000000-0000-4000-8000-0000000000f1";

fn class(catalog: &SchemaCatalog, name: &str) -> ClassId {
    catalog.class_id_for_name(name).expect("class exists")
}

fn field(catalog: &SchemaCatalog, class_name: &str, name: &str) -> FieldId {
    catalog
        .field_by_name(class(catalog, class_name), name)
        .expect("field exists")
        .id
}

fn objects(store: &MemoryStore, catalog: &SchemaCatalog, class_name: &str) -> Vec<ObjectId> {
    store.objects_of_class(class(catalog, class_name))
}

fn text(store: &MemoryStore, object: ObjectId, field: FieldId) -> Option<String> {
    store
        .multilingual_all(object, field)
        .into_iter()
        .next()
        .map(|(_, t)| t.text)
}

fn scalar_text(store: &MemoryStore, object: ObjectId, field: FieldId) -> Option<String> {
    store
        .scalar(object, field)
        .and_then(|v| v.as_text().map(str::to_string))
}

fn guid(raw: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(raw).expect("valid guid")
}

/// A project with English and French, a semantic domain list and a lexicon.
fn project(domains: &str, entries: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<FwDatabase>
  <LangProject id="I{{00000000-0000-4000-8000-000000000001}}">
    <WritingSystems6001>
      <LgWritingSystem id="I{{{G_EN}}}"><ICULocale24><Uni>en</Uni></ICULocale24></LgWritingSystem>
      <LgWritingSystem id="I{{{G_FR}}}"><ICULocale24><Uni>fr</Uni></ICULocale24></LgWritingSystem>
    </WritingSystems6001>
    <SemanticDomainList6001>
      <CmPossibilityList id="I{{00000000-0000-4000-8000-000000000002}}">
        <Possibilities8>{domains}</Possibilities8>
      </CmPossibilityList>
    </SemanticDomainList6001>
    <LexDb6001>
      <LexDb id="I{{00000000-0000-4000-8000-000000000003}}">
        <Entries5005>{entries}</Entries5005>
      </LexDb>
    </LexDb6001>
  </LangProject>
</FwDatabase>
"#
    )
}

fn domain(guid: &str, name: &str) -> String {
    format!(
        r#"<CmSemanticDomain id="I{{{guid}}}"><Name7><AUni ws="en">{name}</AUni></Name7></CmSemanticDomain>"#
    )
}

fn update(items: &str, directives: &str) -> String {
    format!("<FwDatabase><Possibilities8>{items}</Possibilities8>{directives}</FwDatabase>")
}

fn load_project(store: &mut MemoryStore, catalog: &SchemaCatalog, xml: String) {
    let mut loader = Loader::new(store, catalog);
    loader
        .load_full_database(&XmlSource::text("project.xml", xml))
        .expect("project loads");
}

fn domain_list(store: &MemoryStore) -> ObjectId {
    store
        .lookup_guid(&guid("00000000-0000-4000-8000-000000000002"))
        .expect("domain list exists")
}

// ============================================================================
// Full load
// ============================================================================

#[test]
fn test_full_load_creates_widget_and_part() {
    let catalog = SchemaCatalog::from_dsl(WIDGET_SCHEMA).expect("schema parses");
    let mut store = MemoryStore::new();
    let xml = format!(
        r#"<FwDatabase>
  <Widget id="g{{{G_WIDGET}}}">
    <Val100><Integer val="5"/></Val100>
    <Parts100>
      <Part id="I{{{G_PART}}}"><Label101><Uni>left</Uni></Label101></Part>
    </Parts100>
  </Widget>
</FwDatabase>"#
    );

    let report = Loader::new(&mut store, &catalog)
        .load_full_database(&XmlSource::text("widget.xml", xml))
        .expect("load succeeds");

    assert_eq!(report.objects_created, 2);
    let widgets = objects(&store, &catalog, "Widget");
    let parts = objects(&store, &catalog, "Part");
    assert_eq!(widgets.len(), 1);
    assert_eq!(parts.len(), 1);

    let widget = widgets[0];
    assert_eq!(store.lookup_guid(&guid(G_WIDGET)), Some(widget));
    let part = store.object(parts[0]).expect("part row");
    let owner = part.owner.expect("part is owned");
    assert_eq!(owner.owner, widget);
    assert_eq!(owner.field, field(&catalog, "Widget", "Parts"));
    assert_eq!(owner.ord, Some(1));
    assert_eq!(
        store.scalar(widget, field(&catalog, "Widget", "Val")),
        Some(ScalarValue::Integer(5))
    );
    assert_eq!(
        scalar_text(&store, parts[0], field(&catalog, "Part", "Label")).as_deref(),
        Some("left")
    );
}

#[test]
fn test_full_load_requires_empty_store() {
    let catalog = SchemaCatalog::from_dsl(WIDGET_SCHEMA).expect("schema parses");
    let mut store = MemoryStore::new();
    let xml = format!(r#"<FwDatabase><Widget id="I{{{G_WIDGET}}}"/></FwDatabase>"#);
    Loader::new(&mut store, &catalog)
        .load_full_database(&XmlSource::text("a.xml", xml.clone()))
        .expect("first load succeeds");

    let err = Loader::new(&mut store, &catalog)
        .load_full_database(&XmlSource::text("a.xml", xml))
        .expect_err("second load is refused");
    assert!(matches!(err, LoadError::StoreNotEmpty(1)));
}

#[test]
fn test_snapshot_survives_a_round_trip() {
    let catalog = SchemaCatalog::from_dsl(WIDGET_SCHEMA).expect("schema parses");
    let mut store = MemoryStore::new();
    let xml = format!(
        r#"<FwDatabase><Widget id="I{{{G_WIDGET}}}"><Val100><Integer val="9"/></Val100></Widget></FwDatabase>"#
    );
    Loader::new(&mut store, &catalog)
        .load_full_database(&XmlSource::text("w.xml", xml))
        .expect("load succeeds");

    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("store.cmdb");
    store.save(&path).expect("snapshot written");
    let reopened = MemoryStore::load(&path).expect("snapshot read");

    let widget = reopened.lookup_guid(&guid(G_WIDGET)).expect("widget survives");
    assert_eq!(
        reopened.scalar(widget, field(&catalog, "Widget", "Val")),
        Some(ScalarValue::Integer(9))
    );
}

// ============================================================================
// Implicit references
// ============================================================================

#[test]
fn test_possibility_link_creates_one_item_and_reuses_it() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let msa = |n: u32| {
        format!(
            r#"<LexEntry id="I{{10000000-0000-4000-8000-00000000000{n}}}">
                 <MorphoSyntaxAnalyses5002>
                   <MoStemMsa><PartOfSpeech5001><Link ws="en" name="Noun"/></PartOfSpeech5001></MoStemMsa>
                 </MorphoSyntaxAnalyses5002>
               </LexEntry>"#
        )
    };
    let entries = format!("{}{}", msa(1), msa(2));
    load_project(&mut store, &catalog, project("", &entries));

    let pos = objects(&store, &catalog, "PartOfSpeech");
    assert_eq!(pos.len(), 1, "the second link reuses the first item");
    let noun = pos[0];
    assert_eq!(
        text(&store, noun, field(&catalog, "CmPossibility", "Name")).as_deref(),
        Some("Noun")
    );
    assert_eq!(
        text(&store, noun, field(&catalog, "CmPossibility", "Abbreviation")).as_deref(),
        Some("Noun")
    );

    let pos_field = field(&catalog, "MoStemMsa", "PartOfSpeech");
    let msas = objects(&store, &catalog, "MoStemMsa");
    assert_eq!(msas.len(), 2);
    for msa in msas {
        let refs = store.references(msa, pos_field);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].target, noun);
    }

    // The item lives in the project's part-of-speech list.
    let owner = store.object(noun).and_then(|r| r.owner).expect("item is owned");
    let list = store.object(owner.owner).expect("list row");
    assert_eq!(list.class, class(&catalog, "CmPossibilityList"));
    let project_id = objects(&store, &catalog, "LangProject")[0];
    assert_eq!(list.owner.map(|o| o.owner), Some(project_id));
}

#[test]
fn test_unknown_sense_locator_fabricates_entry_and_sense() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let entries = r#"
      <LexEntry id="I{20000000-0000-4000-8000-000000000001}">
        <CitationForm5002><AUni ws="fr">courir</AUni></CitationForm5002>
        <LexEntryReferences><Link type="Synonym" ws="fr" sense="Xyzzy 1"/></LexEntryReferences>
      </LexEntry>"#;
    let report = {
        let mut loader = Loader::new(&mut store, &catalog);
        loader
            .load_full_database(&XmlSource::text("lexicon.xml", project("", entries)))
            .expect("load succeeds")
    };

    let lex_entries = objects(&store, &catalog, "LexEntry");
    let senses = objects(&store, &catalog, "LexSense");
    assert_eq!(lex_entries.len(), 2, "one stand-in entry");
    assert_eq!(senses.len(), 1, "one stand-in sense");
    assert_eq!(report.stand_ins, 2);

    let entry_residue = field(&catalog, "LexEntry", "ImportResidue");
    let stand_in = lex_entries
        .iter()
        .copied()
        .find(|e| scalar_text(&store, *e, entry_residue).is_some())
        .expect("stand-in entry carries residue");
    let lexeme = store.owned_objects(stand_in, field(&catalog, "LexEntry", "LexemeForm"));
    assert_eq!(lexeme.len(), 1);
    assert_eq!(
        text(&store, lexeme[0], field(&catalog, "MoForm", "Form")).as_deref(),
        Some("Xyzzy")
    );

    let sense = senses[0];
    assert_eq!(
        store.object(sense).and_then(|r| r.owner).map(|o| o.owner),
        Some(stand_in)
    );
    assert!(scalar_text(&store, sense, field(&catalog, "LexSense", "ImportResidue")).is_some());

    let targets = field(&catalog, "LexReference", "Targets");
    let relations = objects(&store, &catalog, "LexReference");
    assert_eq!(relations.len(), 1);
    let members: Vec<ObjectId> = store
        .references(relations[0], targets)
        .into_iter()
        .map(|r| r.target)
        .collect();
    assert!(members.contains(&sense));
}

#[test]
fn test_repeated_sense_locator_reuses_one_stand_in() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let linking = |form: &str, relation: &str| {
        format!(
            r#"<LexEntry>
                 <CitationForm5002><AUni ws="fr">{form}</AUni></CitationForm5002>
                 <LexEntryReferences>
                   <Link type="{relation}" ws="fr" sense="courir 3"/>
                 </LexEntryReferences>
               </LexEntry>"#
        )
    };
    let entries = format!(
        r#"<LexEntry>
             <CitationForm5002><AUni ws="fr">courir</AUni></CitationForm5002>
             <Senses5002><LexSense/></Senses5002>
           </LexEntry>{}{}"#,
        linking("aller", "Synonym"),
        linking("marcher", "Antonym")
    );
    let report = {
        let mut loader = Loader::new(&mut store, &catalog);
        loader
            .load_full_database(&XmlSource::text("lexicon.xml", project("", &entries)))
            .expect("load succeeds")
    };

    assert_eq!(objects(&store, &catalog, "LexEntry").len(), 3);
    let senses = objects(&store, &catalog, "LexSense");
    assert_eq!(senses.len(), 2, "one real sense and one stand-in");
    assert_eq!(report.stand_ins, 1);
    let stand_in = senses
        .iter()
        .copied()
        .find(|s| scalar_text(&store, *s, field(&catalog, "LexSense", "ImportResidue")).is_some())
        .expect("stand-in sense carries residue");

    let targets = field(&catalog, "LexReference", "Targets");
    let relations = objects(&store, &catalog, "LexReference");
    assert_eq!(relations.len(), 2, "one synonym and one antonym relation");
    for relation in relations {
        let members: Vec<ObjectId> = store
            .references(relation, targets)
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert!(members.contains(&stand_in), "{members:?}");
    }
}

// ============================================================================
// List updates
// ============================================================================

const G_A: &str = "30000000-0000-4000-8000-00000000000a";
const G_B: &str = "30000000-0000-4000-8000-00000000000b";
const G_C: &str = "30000000-0000-4000-8000-00000000000c";
const G_D: &str = "30000000-0000-4000-8000-00000000000d";

fn sense_linking(target: &str) -> String {
    format!(
        r#"<LexEntry id="I{{40000000-0000-4000-8000-000000000001}}">
             <Senses5002>
               <LexSense id="I{{40000000-0000-4000-8000-000000000002}}">
                 <SemanticDomains5016><Link target="I{{{target}}}"/></SemanticDomains5016>
               </LexSense>
             </Senses5002>
           </LexEntry>"#
    )
}

#[test]
fn test_merge_redirects_references() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let domains = format!("{}{}", domain(G_A, "Alpha"), domain(G_B, "Beta"));
    load_project(&mut store, &catalog, project(&domains, &sense_linking(G_A)));

    let a = store.lookup_guid(&guid(G_A)).expect("A loaded");
    let b = store.lookup_guid(&guid(G_B)).expect("B loaded");
    let sense = objects(&store, &catalog, "LexSense")[0];
    let domains_field = field(&catalog, "LexSense", "SemanticDomains");
    assert_eq!(store.references(sense, domains_field)[0].target, a);

    let list = domain_list(&store);
    let doc = update(
        &domain(G_B, "Beta"),
        &format!(r#"<Merge from="{G_A}" to="{G_B}"/>"#),
    );
    let report = Loader::new(&mut store, &catalog)
        .update_list_from_xml(
            &XmlSource::text("domains.xml", doc),
            list,
            field(&catalog, "CmPossibilityList", "Possibilities"),
        )
        .expect("update succeeds");

    assert!(!store.contains(a), "merged-away item is deleted");
    assert!(store.contains(b));
    let refs = store.references(sense, domains_field);
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].target, b);
    assert_eq!(
        text(&store, b, field(&catalog, "CmPossibility", "Name")).as_deref(),
        Some("Beta")
    );
    let summary = report.reconcile.expect("reconcile summary");
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.links_repaired, 1);
}

#[test]
fn test_noop_list_update_changes_no_structure() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let domains = format!(
        "{}{}{}",
        domain(G_A, "Alpha"),
        domain(G_B, "Beta"),
        domain(G_C, "Gamma")
    );
    load_project(&mut store, &catalog, project(&domains, ""));
    let list = domain_list(&store);
    let before = store.object_count();
    store.reset_stats();

    let report = Loader::new(&mut store, &catalog)
        .update_list_from_xml(
            &XmlSource::text("domains.xml", update(&domains, "")),
            list,
            field(&catalog, "CmPossibilityList", "Possibilities"),
        )
        .expect("update succeeds");

    let stats = store.stats();
    assert_eq!(stats.structural(), 0, "{stats:?}");
    assert_eq!(store.object_count(), before);
    assert_eq!(report.diagnostic_count(DiagnosticKind::RowFailure), 0);
    let summary = report.reconcile.expect("reconcile summary");
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.created + summary.moved + summary.deleted + summary.merged, 0);
}

#[test]
fn test_list_update_conserves_revised_items() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let original = format!(
        "{}{}{}",
        domain(G_A, "Alpha"),
        domain(G_B, "Beta"),
        domain(G_C, "Gamma")
    );
    load_project(&mut store, &catalog, project(&original, ""));
    let list = domain_list(&store);
    let possibilities = field(&catalog, "CmPossibilityList", "Possibilities");
    let original_len = store.owned_objects(list, possibilities).len();

    let revised = format!(
        "{}{}{}",
        domain(G_C, "Gamma"),
        domain(G_B, "Beta"),
        domain(G_D, "Delta")
    );
    let doc = update(&revised, &format!(r#"<Delete guid="{G_A}"/>"#));
    let report = Loader::new(&mut store, &catalog)
        .update_list_from_xml(&XmlSource::text("domains.xml", doc), list, possibilities)
        .expect("update succeeds");
    let summary = report.reconcile.expect("reconcile summary");

    let items = store.owned_objects(list, possibilities);
    assert_eq!(
        items.len(),
        original_len - summary.deleted - summary.merged + summary.created
    );
    let expected: Vec<ObjectId> = [G_C, G_B, G_D]
        .iter()
        .map(|g| store.lookup_guid(&guid(g)).expect("revised item exists"))
        .collect();
    assert_eq!(items, expected, "sequence follows the revised order");
    assert!(store.lookup_guid(&guid(G_A)).is_none());
    for (index, item) in items.iter().enumerate() {
        let ord = store.object(*item).and_then(|r| r.owner).and_then(|o| o.ord);
        assert_eq!(ord, Some(index as u32 + 1));
    }
}

#[test]
fn test_items_missing_from_the_update_are_kept_as_custom() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    load_project(&mut store, &catalog, project(&nested_domains(), ""));
    let list = domain_list(&store);
    let possibilities = field(&catalog, "CmPossibilityList", "Possibilities");
    let subs = field(&catalog, "CmPossibility", "SubPossibilities");

    let report = Loader::new(&mut store, &catalog)
        .update_list_from_xml(
            &XmlSource::text("domains.xml", update(&domain(G_A, "Alpha"), "")),
            list,
            possibilities,
        )
        .expect("update succeeds");

    let a = store.lookup_guid(&guid(G_A)).expect("A kept");
    let b = store.lookup_guid(&guid(G_B)).expect("B kept as custom");
    let child = store.lookup_guid(&guid(G_C)).expect("nested item kept as custom");
    assert_eq!(store.owned_objects(list, possibilities), vec![a, b]);
    assert_eq!(store.owned_objects(a, subs), vec![child]);
    let summary = report.reconcile.expect("reconcile summary");
    assert_eq!(summary.custom, 2);
    assert_eq!(summary.deleted, 0);
}

/// A at the top with custom child C, and B beside it.
fn nested_domains() -> String {
    let nested = format!(
        r#"<CmSemanticDomain id="I{{{G_A}}}">
             <Name7><AUni ws="en">Alpha</AUni></Name7>
             <SubPossibilities7>{}</SubPossibilities7>
           </CmSemanticDomain>"#,
        domain(G_C, "Alpha child")
    );
    format!("{nested}{}", domain(G_B, "Beta"))
}

#[test]
fn test_custom_child_of_a_merged_item_moves_to_the_merge_target() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    load_project(&mut store, &catalog, project(&nested_domains(), ""));
    let list = domain_list(&store);
    let possibilities = field(&catalog, "CmPossibilityList", "Possibilities");
    let subs = field(&catalog, "CmPossibility", "SubPossibilities");
    let doc = update(
        &domain(G_B, "Beta"),
        &format!(r#"<Merge from="{G_A}" to="{G_B}"/>"#),
    );

    let report = Loader::new(&mut store, &catalog)
        .update_list_from_xml(&XmlSource::text("domains.xml", doc), list, possibilities)
        .expect("update succeeds");

    assert!(store.lookup_guid(&guid(G_A)).is_none());
    let b = store.lookup_guid(&guid(G_B)).expect("B kept");
    let child = store.lookup_guid(&guid(G_C)).expect("custom child survives");
    assert_eq!(store.owned_objects(list, possibilities), vec![b]);
    assert_eq!(store.owned_objects(b, subs), vec![child]);
    let ord = store.object(child).and_then(|r| r.owner).and_then(|o| o.ord);
    assert_eq!(ord, Some(1));
    let summary = report.reconcile.expect("reconcile summary");
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.custom, 1);
}

#[test]
fn test_custom_child_of_a_deleted_item_moves_up_to_the_list() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    load_project(&mut store, &catalog, project(&nested_domains(), ""));
    let list = domain_list(&store);
    let possibilities = field(&catalog, "CmPossibilityList", "Possibilities");
    let doc = update(&domain(G_B, "Beta"), &format!(r#"<Delete guid="{G_A}"/>"#));

    Loader::new(&mut store, &catalog)
        .update_list_from_xml(&XmlSource::text("domains.xml", doc), list, possibilities)
        .expect("update succeeds");

    assert!(store.lookup_guid(&guid(G_A)).is_none());
    let b = store.lookup_guid(&guid(G_B)).expect("B kept");
    let child = store.lookup_guid(&guid(G_C)).expect("custom child survives");
    assert_eq!(store.owned_objects(list, possibilities), vec![b, child]);
}

#[test]
fn test_directives_outside_list_updates_are_ignored() {
    let catalog = core_catalog().expect("core schema");
    let mut store = MemoryStore::new();
    let xml = format!(
        r#"<FwDatabase>
  <LgWritingSystem id="I{{{G_EN}}}"><ICULocale24><Uni>en</Uni></ICULocale24></LgWritingSystem>
  <Delete guid="{G_EN}"/>
</FwDatabase>"#
    );
    let report = Loader::new(&mut store, &catalog)
        .load_full_database(&XmlSource::text("ws.xml", xml))
        .expect("load succeeds");
    assert!(store.lookup_guid(&guid(G_EN)).is_some());
    assert!(report.diagnostic_count(DiagnosticKind::DataQuality) >= 1);
}
