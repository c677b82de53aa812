// =============================================================================
// TESTS — Scénarios de chaînage de bout en bout
// =============================================================================
//
// Jeu de données géologique, en deux chargements :
//
//   scope "units" (base geo)            scope "mappedfeature" (base mf)
//     GeologicUnit    (dénormalisé)       MappedFeature
//       └─ composition → CompositionPart    └─ specification → GeologicUnit
//            └─ lithology → ControlledConcept        (scope lié)
//       └─ occurrence  ⇢ MappedFeature (référence)
//
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use pretty_assertions::assert_eq;
use crate::backend::memory::{MemoryCatalog, MemoryTable};
use crate::config::EngineConfig;
use crate::error::ErrorKind;
use super::expression::{DefaultEvaluator, Expression, ExpressionEvaluator, Filter, Predicate};
use super::feature::MaterializedFeature;
use super::iterator::{IteratorState, MappingFeatureIterator};
use super::mapping::{AttributeMapping, FeatureTypeMapping};
use super::path::HopKind;
use super::query::{Query, SortOrder};
use super::scope::MappingScope;
use super::source::{Row, SourceDescriptor};
use super::typeside::Value;

const MAPPED_FEATURE: &str = "\
_=ID:String,NAME:String,GU_ID:String
mf1=mf1|MERGED BASALT|gu.25699
mf2=mf2|ROCKLEA DOME|gu.25678
mf3=mf3|ROCKLEA DOME 2|gu.25678
mf4=mf4|MURRADUC BASALT|gu.25682
mf5=mf5|UNKNOWN|
";

const GEOLOGIC_UNIT: &str = "\
_=ID:String,NAME:String,TEXTDESCRIPTION:String,MF_ID:String,COLOR:String
gu.25699=gu.25699|Yaugher Volcanic Group|Olivine basalt, tuff, microgabbro, minor sedimentary rocks|mf1|Blue
gu.25678=gu.25678|Yaugher Volcanic Group 1|Olivine basalt, tuff, microgabbro, minor sedimentary rocks|mf2|Yellow
gu.25678=gu.25678|Yaugher Volcanic Group 2|Olivine basalt, tuff, microgabbro, minor sedimentary rocks|mf3|Blue
gu.25678=gu.25678|-Py|Olivine basalt, tuff, microgabbro, minor sedimentary rocks||
gu.25682=gu.25682|New Automan Sandstone|Medium to coarse grained sandstone|mf4|Red
";

const COMPOSITION_PART: &str = "\
_=ID:String,GU_ID:String,PROPORTION:String
cp.167775491936278899=cp.167775491936278899|gu.25699|minor
cp.167775491936278844=cp.167775491936278844|gu.25678|significant
cp.167775491936278856=cp.167775491936278856|gu.25678|minor
cp.167775491936278812=cp.167775491936278812|gu.25682|significant
";

const CONTROLLED_CONCEPT: &str = "\
_=NAME:String,COMPOSITION_ID:String
cc.1=name_a|cp.167775491936278812
cc.1=name_b|cp.167775491936278812
cc.1=name_c|cp.167775491936278812
cc.2=name_2|cp.167775491936278812
cc.3=name_3|cp.167775491936278844
cc.4=name_4|cp.167775491936278856
cc.5=name_5|cp.167775491936278899
";

const SIMPLE_CONTENT: &str = "\
_=STRING:String,LINK_ONE:String,LINK_TWO:String
sc.1=string_one|cc.1|cc.2
sc.2=string_two|cc.1|cc.2
sc.3=string_three||cc.2
";

fn col(c: &str) -> Expression {
    Expression::column(c)
}

fn table(text: &str) -> MemoryTable {
    MemoryTable::from_properties(text).unwrap()
}

fn db(name: &str) -> SourceDescriptor {
    SourceDescriptor::new("memory").param("database", name)
}

fn catalog() -> Arc<MemoryCatalog> {
    let c = MemoryCatalog::new();
    c.add_table("mf", "MappedFeature", table(MAPPED_FEATURE));
    c.add_table("geo", "GeologicUnit", table(GEOLOGIC_UNIT));
    c.add_table("geo", "CompositionPart", table(COMPOSITION_PART));
    c.add_table("geo", "ControlledConcept", table(CONTROLLED_CONCEPT));
    c.add_table("geo", "SimpleContent", table(SIMPLE_CONTENT));
    Arc::new(c)
}

fn mf_mapping() -> FeatureTypeMapping {
    let mut m = FeatureTypeMapping::new("gsml:MappedFeature", "MappedFeature", col("ID"), db("mf"));
    m.map_attr("gml:name", col("NAME"))
     .add(AttributeMapping::nested("gsml:specification", col("GU_ID"), "gsml:GeologicUnit", col("ID")));
    m
}

fn gu_mapping() -> FeatureTypeMapping {
    let mut m = FeatureTypeMapping::new("gsml:GeologicUnit", "GeologicUnit", col("ID"), db("geo"));
    m.denormalized(true)
     .map_attr("gml:description", col("TEXTDESCRIPTION"))
     .map_multi("gml:name", col("NAME"))
     .add(AttributeMapping::nested("gsml:composition", col("ID"), "gsml:CompositionPart", col("GU_ID")).multiple())
     .add(AttributeMapping::reference("gsml:occurrence", col("MF_ID"), "urn:cgi:feature:MappedFeature:{}").multiple())
     .map_multi("gsml:exposureColor/gsml:CGI_TermValue/gsml:value", col("COLOR"));
    m
}

fn cp_mapping() -> FeatureTypeMapping {
    let mut m = FeatureTypeMapping::new("gsml:CompositionPart", "CompositionPart", col("ID"), db("geo"));
    m.map_attr("gsml:proportion/gsml:CGI_TermValue/gsml:value", col("PROPORTION"))
     .add(AttributeMapping::nested("gsml:lithology", col("ID"), "gsml:ControlledConcept", col("COMPOSITION_ID")).multiple());
    m
}

fn cc_mapping() -> FeatureTypeMapping {
    let mut m = FeatureTypeMapping::new("gsml:ControlledConcept", "ControlledConcept", col("FID"), db("geo"));
    m.denormalized(true).map_multi("gml:name", col("NAME"));
    m
}

struct Fixture {
    catalog: Arc<MemoryCatalog>,
    units: Arc<MappingScope>,
    mf: Arc<MappingScope>,
}

fn load_with(config: EngineConfig) -> Fixture {
    let catalog = catalog();
    let units = MappingScope::load(
        "units",
        vec![gu_mapping(), cp_mapping(), cc_mapping()],
        catalog.clone(),
        vec![],
        config.clone(),
    ).unwrap();
    let mf = MappingScope::load("mappedfeature", vec![mf_mapping()], catalog.clone(), vec![Arc::clone(&units)], config)
        .unwrap();
    Fixture { catalog, units, mf }
}

fn load() -> Fixture {
    load_with(EngineConfig::default())
}

fn collect(scope: &Arc<MappingScope>, type_name: &str, query: Query) -> Vec<MaterializedFeature> {
    scope.features(type_name, query).unwrap().map(|r| r.unwrap()).collect()
}

fn ids(features: &[MaterializedFeature]) -> Vec<&str> {
    features.iter().filter_map(|f| f.id()).collect()
}

fn texts(feature: &MaterializedFeature, name: &str) -> Vec<String> {
    feature.get_properties(name).iter()
        .filter_map(|p| p.simple_value())
        .map(|v| v.as_text())
        .collect()
}

fn nested_ids(feature: &MaterializedFeature, name: &str) -> Vec<String> {
    feature.get_properties(name).iter()
        .flat_map(|p| p.nested_features())
        .filter_map(|f| f.id().map(str::to_string))
        .collect()
}

fn path(p: &str) -> String {
    p.to_string()
}

// ─── Chaînage ────────────────────────────────────────────────────────────────

#[test]
fn test_feature_chaining() {
    let fx = load();
    let units: HashMap<String, MaterializedFeature> = collect(&fx.units, "gsml:GeologicUnit", Query::all())
        .into_iter()
        .map(|f| (f.id().unwrap_or_default().to_string(), f))
        .collect();

    let mfs = collect(&fx.mf, "gsml:MappedFeature", Query::all());
    assert_eq!(ids(&mfs), vec!["mf1", "mf2", "mf3", "mf4", "mf5"]);

    let expected = [("mf1", "gu.25699"), ("mf2", "gu.25678"), ("mf3", "gu.25678"), ("mf4", "gu.25682")];
    for (mf_id, gu_id) in expected {
        let mf = mfs.iter().find(|f| f.id() == Some(mf_id)).unwrap();
        let spec = mf.get_properties("specification");
        assert_eq!(spec.len(), 1);
        let nested = spec[0].nested_features()[0];
        // même contenu que la feature lue directement
        assert_eq!(nested, &units[gu_id]);
    }

    let orphan = mfs.iter().find(|f| f.id() == Some("mf5")).unwrap();
    assert!(orphan.get_properties("specification").is_empty());
}

#[test]
fn test_denormalized_group_is_one_feature() {
    let fx = load();
    let units = collect(&fx.units, "gsml:GeologicUnit", Query::all());
    assert_eq!(ids(&units), vec!["gu.25678", "gu.25682", "gu.25699"]);

    let gu = &units[0];
    assert_eq!(texts(gu, "gml:name"), vec!["Yaugher Volcanic Group 1", "Yaugher Volcanic Group 2", "-Py"]);
    assert_eq!(gu.get_properties("description").len(), 1);
    assert_eq!(
        nested_ids(gu, "composition"),
        vec!["cp.167775491936278844", "cp.167775491936278856"]
    );
    let colors: Vec<String> = gu.find_all("exposureColor/CGI_TermValue/value").iter()
        .filter_map(|p| p.simple_value().map(|v| v.as_text()))
        .collect();
    assert_eq!(colors, vec!["Yellow", "Blue"]);
}

#[test]
fn test_many_on_chained_side() {
    let fx = load();
    let concepts = collect(&fx.units, "gsml:ControlledConcept", Query::all());
    assert_eq!(concepts.len(), 5);
    assert_eq!(texts(&concepts[0], "name"), vec!["name_a", "name_b", "name_c"]);

    for cp in collect(&fx.units, "gsml:CompositionPart", Query::all()) {
        let lithologies = nested_ids(&cp, "lithology");
        if cp.id() == Some("cp.167775491936278812") {
            assert_eq!(lithologies, vec!["cc.1", "cc.2"]);
        } else {
            assert_eq!(lithologies.len(), 1);
        }
    }
}

#[test]
fn test_multi_valued_properties_by_reference() {
    let fx = load();
    let before = fx.catalog.cursors_opened();
    let units = collect(&fx.units, "gsml:GeologicUnit", Query::all());

    let expected = [
        ("gu.25678", vec!["mf2", "mf3"]),
        ("gu.25682", vec!["mf4"]),
        ("gu.25699", vec!["mf1"]),
    ];
    for (gu, (id, mfs)) in units.iter().zip(expected) {
        assert_eq!(gu.id(), Some(id));
        let occurrences = gu.get_properties("occurrence");
        assert_eq!(occurrences.len(), mfs.len());
        for (p, mf) in occurrences.iter().zip(mfs) {
            assert!(p.is_empty());
            assert!(p.children().is_empty());
            assert_eq!(
                p.client_property("xlink:href"),
                Some(&Value::String(format!("urn:cgi:feature:MappedFeature:{}", mf)))
            );
        }
    }

    // ControlledConcept est dénormalisé et lié par COMPOSITION_ID : deux
    // lectures par lithologie. Aucune lecture de MappedFeature.
    assert_eq!(fx.catalog.cursors_opened() - before, 1 + 3 + 2 * 4);
    assert_eq!(fx.catalog.cursors_opened_on("GeologicUnit"), 1);
    assert_eq!(fx.catalog.cursors_opened_on("CompositionPart"), 3);
    assert_eq!(fx.catalog.cursors_opened_on("ControlledConcept"), 8);
    assert_eq!(fx.catalog.cursors_opened_on("MappedFeature"), 0);
}

#[test]
fn test_reference_cycle_terminates() {
    let catalog = catalog();
    let mut a = FeatureTypeMapping::new("ex:A", "MappedFeature", col("ID"), db("mf"));
    a.add(AttributeMapping::reference("ex:unit", col("GU_ID"), "#{}"));
    let mut b = FeatureTypeMapping::new("ex:B", "GeologicUnit", col("ID"), db("geo"));
    b.denormalized(true).add(AttributeMapping::reference("ex:feature", col("MF_ID"), "#{}").multiple());

    let scope = MappingScope::load("refs", vec![a, b], catalog.clone(), vec![], EngineConfig::default()).unwrap();
    assert_eq!(collect(&scope, "ex:A", Query::all()).len(), 5);
    assert_eq!(collect(&scope, "ex:B", Query::all()).len(), 3);
    assert_eq!(catalog.cursors_opened(), 2);
}

fn nested_child<'a>(parents: &'a [MaterializedFeature], id: &str) -> &'a MaterializedFeature {
    let parent = parents.iter().find(|f| f.id() == Some(id)).unwrap();
    parent.get_properties("child")[0].nested_features()[0]
}

#[test]
fn test_nested_features_are_fresh_per_parent() {
    let parent = "_=ID:String,CHILD:String\np1=p1|n.0\np2=p2|n.1\np3=p3|n.2\np4=p4|n.1\np5=p5|\n";
    let nested = "_=ID:String,NAME:String,LABEL:String\nn.1=n.1|alpha|Same\nn.1=n.1|beta|Same\n";
    let grandchild = "_=ID:String,NESTED_ID:String\ng.1=g.1|n.1\ng.2=g.2|n.1\n";
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_table("ex", "Parent", table(parent));
    catalog.add_table("ex", "Nested", table(nested));
    catalog.add_table("ex", "Grandchild", table(grandchild));

    let mut p = FeatureTypeMapping::new("ex:Parent", "Parent", col("ID"), db("ex"));
    p.add(AttributeMapping::nested("ex:child", col("CHILD"), "ex:Nested", col("ID")));
    let mut n = FeatureTypeMapping::new("ex:Nested", "Nested", col("ID"), db("ex"));
    n.denormalized(true)
     .map_multi("gml:name", col("NAME"))
     .map_attr("gsml:name", col("LABEL"))
     .add(AttributeMapping::nested("ex:part", col("ID"), "ex:Grandchild", col("NESTED_ID")).multiple());
    let mut g = FeatureTypeMapping::new("ex:Grandchild", "Grandchild", col("ID"), db("ex"));
    g.map_attr("ex:code", col("ID"));

    let scope = MappingScope::load("example", vec![p, n, g], catalog.clone(), vec![], EngineConfig::default()).unwrap();
    let parents = collect(&scope, "ex:Parent", Query::all());
    assert_eq!(parents.len(), 5);

    let child = |id: &str| nested_child(&parents, id);
    for id in ["p2", "p4"] {
        let n = child(id);
        assert_eq!(n.get_properties("name").len(), 3);
        assert_eq!(nested_ids(n, "part"), vec!["g.1", "g.2"]);
    }
    assert_eq!(child("p2"), child("p4"));
    // n.1 est relu pour chacun des deux parents qui le citent
    assert_eq!(catalog.cursors_opened_on("Nested"), 4);
    assert_eq!(catalog.cursors_opened_on("Grandchild"), 2);

    for id in ["p1", "p3", "p5"] {
        let parent = parents.iter().find(|f| f.id() == Some(id)).unwrap();
        assert!(parent.get_properties("child").is_empty());
    }
}

#[test]
fn test_multiple_feature_links_to_one_type() {
    let catalog = catalog();
    let mut sc = FeatureTypeMapping::new("ex:SimpleContent", "SimpleContent", col("FID"), db("geo"));
    sc.map_attr("ex:someAttribute", col("STRING"))
      .map_attr("FEATURE_LINK[1]", col("LINK_ONE"))
      .map_attr("FEATURE_LINK[2]", col("LINK_TWO"));
    let parent = |name: &str, link: &str| {
        let mut m = FeatureTypeMapping::new(name, "ControlledConcept", col("FID"), db("geo"));
        m.denormalized(true)
         .add(AttributeMapping::nested("ex:nestedFeature", col("FID"), "ex:SimpleContent", col(link)).multiple());
        m
    };
    let scope = MappingScope::load(
        "links",
        vec![sc, parent("ex:FirstParentFeature", "LINK_ONE"), parent("ex:SecondParentFeature", "LINK_TWO")],
        catalog,
        vec![],
        EngineConfig::default(),
    ).unwrap();

    let first = collect(&scope, "ex:FirstParentFeature", Query::all());
    assert_eq!(first.len(), 5);
    for f in &first {
        let children = nested_ids(f, "nestedFeature");
        if f.id() == Some("cc.1") {
            assert_eq!(children, vec!["sc.1", "sc.2"]);
        } else {
            assert!(children.is_empty());
        }
    }

    let second = collect(&scope, "ex:SecondParentFeature", Query::all());
    let cc2 = second.iter().find(|f| f.id() == Some("cc.2")).unwrap();
    assert_eq!(nested_ids(cc2, "nestedFeature"), vec!["sc.1", "sc.2", "sc.3"]);
    let sc1 = cc2.get_properties("nestedFeature")[0].nested_features()[0];
    assert_eq!(texts(sc1, "someAttribute"), vec!["string_one"]);
    assert_eq!(texts(sc1, "FEATURE_LINK"), vec!["cc.1", "cc.2"]);
    let sc3 = cc2.get_properties("nestedFeature")[2].nested_features()[0];
    assert_eq!(texts(sc3, "FEATURE_LINK"), vec!["cc.2"]);
}

const OWNER: &str = "\
_=ID:String
p1=p1
p2=p2
p3=p3
";

const TAG: &str = "\
_=NAME:String,PARENT:String
t.1=alpha|p1
t.1=beta|p2
t.2=gamma|p1
";

fn tag_scope(tag_filter: Option<Predicate<Expression>>) -> (Arc<MemoryCatalog>, Arc<MappingScope>) {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_table("ex", "Owner", table(OWNER));
    catalog.add_table("ex", "Tag", table(TAG));

    let mut tag = FeatureTypeMapping::new("ex:Tag", "Tag", col("FID"), db("ex"));
    tag.denormalized(true).map_multi("gml:name", col("NAME"));
    let mut link = AttributeMapping::nested("ex:tag", col("ID"), "ex:Tag", col("PARENT")).multiple();
    if let Some(filter) = tag_filter {
        link = link.with_nested_filter(filter);
    }
    let mut owner = FeatureTypeMapping::new("ex:Owner", "Owner", col("ID"), db("ex"));
    owner.add(link);

    let scope = MappingScope::load("tags", vec![owner, tag], catalog.clone(), vec![], EngineConfig::default()).unwrap();
    (catalog, scope)
}

#[test]
fn test_denormalized_nested_keeps_whole_group() {
    let (catalog, scope) = tag_scope(None);
    let direct = collect(&scope, "ex:Tag", Query::all());
    assert_eq!(ids(&direct), vec!["t.1", "t.2"]);
    assert_eq!(texts(&direct[0], "name"), vec!["alpha", "beta"]);

    let owners = collect(&scope, "ex:Owner", Query::all());
    assert_eq!(ids(&owners), vec!["p1", "p2", "p3"]);
    let tags = |i: usize| -> Vec<MaterializedFeature> {
        owners[i].get_properties("tag").iter()
            .flat_map(|p| p.nested_features())
            .cloned()
            .collect()
    };

    // p1 ne cite t.1 que par la ligne alpha, mais reçoit le groupe entier
    assert_eq!(tags(0), direct);
    assert_eq!(tags(1), vec![direct[0].clone()]);
    assert!(tags(2).is_empty());
    assert_eq!(catalog.open_cursors(), 0);
}

#[test]
fn test_nested_filter_narrows_chained_entries() {
    let catalog = catalog();
    let mut gu = FeatureTypeMapping::new("gsml:GeologicUnit", "GeologicUnit", col("ID"), db("geo"));
    gu.denormalized(true).add(
        AttributeMapping::nested("gsml:composition", col("ID"), "gsml:CompositionPart", col("GU_ID"))
            .multiple()
            .with_nested_filter(Predicate::equals(col("PROPORTION"), "significant")),
    );
    let scope = MappingScope::load("significant", vec![gu, cp_mapping(), cc_mapping()], catalog, vec![], EngineConfig::default())
        .unwrap();

    let units = collect(&scope, "gsml:GeologicUnit", Query::all());
    let compositions: Vec<Vec<String>> = units.iter().map(|u| nested_ids(u, "composition")).collect();
    assert_eq!(
        compositions,
        vec![
            vec!["cp.167775491936278844".to_string()],
            vec!["cp.167775491936278812".to_string()],
            vec![],
        ]
    );
    assert_eq!(units[0].get_properties("composition").len(), 1);
}

#[test]
fn test_nested_filter_on_denormalized_returns_whole_group() {
    let (_, scope) = tag_scope(Some(Predicate::equals(col("NAME"), "beta")));
    let owners = collect(&scope, "ex:Owner", Query::all());
    assert_eq!(nested_ids(&owners[0], "tag"), Vec::<String>::new());
    assert_eq!(nested_ids(&owners[1], "tag"), vec!["t.1"]);
    let t1 = owners[1].get_properties("tag")[0].nested_features()[0];
    assert_eq!(texts(t1, "name"), vec!["alpha", "beta"]);
}

struct LowerCase;

impl ExpressionEvaluator for LowerCase {
    fn evaluate(&self, expr: &Expression, row: &Row) -> crate::error::Result<Value> {
        Ok(match DefaultEvaluator.evaluate(expr, row)? {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other,
        })
    }
}

#[test]
fn test_custom_evaluator() {
    let mut named = FeatureTypeMapping::new("ex:Named", "MappedFeature", col("ID"), db("mf"));
    named.map_attr("gml:name", col("NAME"));
    let scope = MappingScope::load_with_evaluator(
        "lower",
        vec![named],
        catalog(),
        vec![],
        EngineConfig::default(),
        Arc::new(LowerCase),
    ).unwrap();

    let features = collect(&scope, "ex:Named", Query::all());
    assert_eq!(features.len(), 5);
    assert_eq!(texts(&features[0], "name"), vec!["merged basalt"]);
}

// ─── Filtres ─────────────────────────────────────────────────────────────────

#[test]
fn test_filter_on_nested_simple_property() {
    let fx = load();
    let filter = Predicate::like(
        path("gsml:specification/gsml:GeologicUnit/gml:description"),
        "Olivine basalt, tuff, microgabbro, minor sedimentary rocks",
    );
    let found = collect(&fx.mf, "gsml:MappedFeature", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["mf1", "mf2", "mf3"]);
}

#[test]
fn test_filter_on_multi_valued_nested_property() {
    let fx = load();
    let filter: Filter = Predicate::equals(
        path("gsml:composition/gsml:CompositionPart/gsml:proportion/gsml:CGI_TermValue/gsml:value"),
        "significant",
    );
    let found = collect(&fx.units, "gsml:GeologicUnit", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["gu.25678", "gu.25682"]);
}

#[test]
fn test_filter_on_client_property_of_chained_feature() {
    let fx = load();
    let filter = Predicate::like(
        path("gsml:specification/gsml:GeologicUnit/gsml:occurrence/@xlink:href"),
        "urn:cgi:feature:MappedFeature:mf1",
    );
    let found = collect(&fx.mf, "gsml:MappedFeature", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["mf1"]);
}

#[test]
fn test_filter_on_denormalized_keeps_whole_group() {
    let fx = load();
    let filter = Predicate::equals(path("gml:name"), "Yaugher Volcanic Group 2");
    let found = collect(&fx.units, "gsml:GeologicUnit", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["gu.25678"]);
    assert_eq!(texts(&found[0], "name"), vec!["Yaugher Volcanic Group 1", "Yaugher Volcanic Group 2", "-Py"]);

    let filter = Predicate::equals(path("gsml:exposureColor/gsml:CGI_TermValue/gsml:value"), "Yellow");
    let found = collect(&fx.units, "gsml:GeologicUnit", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["gu.25678"]);
}

#[test]
fn test_filter_pushed_down_on_normalized_mapping() {
    let fx = load();
    let filter = Predicate::equals(path("gml:name"), "ROCKLEA DOME");
    let mapping = fx.mf.mapping("gsml:MappedFeature").unwrap();
    let (pushed, residual) = fx.mf.paths().split(&filter, &mapping, &*fx.mf).unwrap();
    assert_eq!(pushed, Some(Predicate::equals(col("NAME"), "ROCKLEA DOME")));
    assert!(residual.is_none());

    let found = collect(&fx.mf, "gsml:MappedFeature", Query::filtered(filter));
    assert_eq!(ids(&found), vec!["mf2"]);
}

#[test]
fn test_bad_path_fails_before_reading() {
    let fx = load();
    let before = fx.catalog.cursors_opened();
    let err = fx.mf
        .features("gsml:MappedFeature", Query::filtered(Predicate::equals(path("gml:nope"), 1i64)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathResolution);
    assert_eq!(fx.catalog.cursors_opened(), before);
}

#[test]
fn test_descriptor_of_simple_attribute_in_nested_feature() {
    let fx = load();
    let mapping = fx.mf.mapping("MappedFeature").unwrap();
    let kind = fx.mf.paths()
        .descriptor("gsml:specification/gsml:GeologicUnit/gml:description", &mapping, &*fx.mf)
        .unwrap();
    assert_eq!(kind, HopKind::Simple);
}

// ─── Requête ─────────────────────────────────────────────────────────────────

#[test]
fn test_sort_offset_max_projection() {
    let fx = load();
    let sorted = collect(
        &fx.units,
        "gsml:GeologicUnit",
        Query::all().sorted_by("gml:description", SortOrder::Ascending),
    );
    assert_eq!(ids(&sorted), vec!["gu.25682", "gu.25678", "gu.25699"]);

    let page = collect(
        &fx.units,
        "gsml:GeologicUnit",
        Query::all()
            .sorted_by("gml:description", SortOrder::Ascending)
            .with_offset(1)
            .with_max_features(1)
            .with_projection(&["gml:name"]),
    );
    assert_eq!(ids(&page), vec!["gu.25678"]);
    assert_eq!(page[0].properties().len(), 3);
    assert!(page[0].properties().iter().all(|p| p.name == "gml:name"));

    let desc = collect(&fx.units, "gsml:GeologicUnit", Query::all().sorted_by("gml:name", SortOrder::Descending));
    assert_eq!(ids(&desc), vec!["gu.25678", "gu.25699", "gu.25682"]);
}

#[test]
fn test_stop_signal_closes_iterator() {
    let fx = load();
    let stop = Arc::new(AtomicBool::new(false));
    let mut it = fx.units
        .features("gsml:GeologicUnit", Query::all().with_stop_signal(Arc::clone(&stop)))
        .unwrap();
    assert!(it.has_next().unwrap());
    it.next_feature().unwrap();
    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(!it.has_next().unwrap());
    assert_eq!(it.state(), IteratorState::Closed);
    assert_eq!(fx.catalog.open_cursors(), 0);
}

// ─── Automate et ressources ──────────────────────────────────────────────────

#[test]
fn test_iterator_states() {
    let fx = load();
    let mapping = fx.units.mapping("GeologicUnit").unwrap();
    let mut it = MappingFeatureIterator::new(Arc::clone(&fx.units), mapping, Query::all());
    assert_eq!(it.state(), IteratorState::Unopened);
    assert_eq!(it.has_next().unwrap_err().kind(), ErrorKind::IllegalState);
    assert_eq!(it.next_feature().unwrap_err().kind(), ErrorKind::IllegalState);

    it.open().unwrap();
    assert_eq!(it.state(), IteratorState::Ready);
    assert_eq!(it.open().unwrap_err().kind(), ErrorKind::IllegalState);

    let mut count = 0;
    while it.has_next().unwrap() {
        it.next_feature().unwrap();
        count += 1;
    }
    assert_eq!(count, 3);
    assert_eq!(it.state(), IteratorState::Exhausted);
    assert!(!it.has_next().unwrap());
    assert_eq!(it.next_feature().unwrap_err().kind(), ErrorKind::IllegalState);

    it.close();
    it.close();
    assert_eq!(it.state(), IteratorState::Closed);
    assert!(!it.has_next().unwrap());
    assert_eq!(it.open().unwrap_err().kind(), ErrorKind::IllegalState);
    assert_eq!(fx.catalog.open_cursors(), 0);
}

#[test]
fn test_early_abandon_releases_cursor() {
    let fx = load();
    {
        let mut it = fx.units.features("gsml:GeologicUnit", Query::all()).unwrap();
        assert!(it.next().is_some());
        assert_eq!(fx.catalog.open_cursors(), 1);
    }
    assert_eq!(fx.catalog.open_cursors(), 0);
}

#[test]
fn test_nested_source_failure_fails_parent() {
    let catalog = catalog();
    catalog.add_table("geo", "CompositionPart", table(COMPOSITION_PART).failing_on_open());
    let units = MappingScope::load(
        "units",
        vec![gu_mapping(), cp_mapping(), cc_mapping()],
        catalog.clone(),
        vec![],
        EngineConfig::default(),
    ).unwrap();

    let mut it = units.features("gsml:GeologicUnit", Query::all()).unwrap();
    let first = it.next().unwrap();
    assert_eq!(first.unwrap_err().kind(), ErrorKind::SourceUnavailable);
    assert_eq!(it.state(), IteratorState::Closed);
    assert!(it.next().is_none());
    assert_eq!(catalog.open_cursors(), 0);
}

#[test]
fn test_mid_stream_failure_discards_group() {
    let catalog = catalog();
    catalog.add_table("geo", "GeologicUnit", table(GEOLOGIC_UNIT).failing_after(2));
    let units = MappingScope::load(
        "units",
        vec![gu_mapping(), cp_mapping(), cc_mapping()],
        catalog.clone(),
        vec![],
        EngineConfig::default(),
    ).unwrap();

    // les deux premières lignes ne bouclent pas le groupe gu.25678
    let results: Vec<_> = units.features("gsml:GeologicUnit", Query::all()).unwrap().collect();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_err());
    assert_eq!(catalog.open_cursors(), 0);
}

#[test]
fn test_nesting_depth_limit() {
    let config = EngineConfig { max_nesting_depth: 1, ..EngineConfig::default() };
    let fx = load_with(config);
    let err = fx.units.features("gsml:GeologicUnit", Query::all()).unwrap()
        .next()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    // sans imbrication profonde, tout va bien
    assert_eq!(collect(&fx.units, "gsml:ControlledConcept", Query::all()).len(), 5);
}

// ─── Sources partagées ───────────────────────────────────────────────────────

#[test]
fn test_source_consolidation_within_scope() {
    let fx = load();
    assert!(fx.units.same_source("gsml:GeologicUnit", "gsml:CompositionPart").unwrap());
    assert!(fx.units.same_source("gsml:GeologicUnit", "gsml:ControlledConcept").unwrap());
    assert_eq!(fx.units.registry().live_sources(), 1);
    assert_eq!(fx.units.registry().ref_count(&db("geo")), 3);

    // MappedFeature vit dans un autre chargement, sur une autre base
    assert_ne!(fx.mf.registry_id(), fx.units.registry_id());
    assert_eq!(fx.catalog.sources_created(), 2);
}

#[test]
fn test_identical_loads_never_share() {
    let catalog = catalog();
    let load = || MappingScope::load("units", vec![gu_mapping(), cp_mapping(), cc_mapping()], catalog.clone(), vec![], EngineConfig::default())
        .unwrap();
    let a = load();
    let b = load();
    assert_eq!(catalog.sources_created(), 2);
    assert_ne!(a.registry_id(), b.registry_id());

    drop(a);
    assert_eq!(catalog.sources_disposed(), 1);
    assert_eq!(collect(&b, "gsml:CompositionPart", Query::all()).len(), 4);
}

#[test]
fn test_dispose_is_idempotent() {
    let fx = load();
    fx.units.dispose();
    fx.units.dispose();
    assert!(fx.units.is_disposed());
    assert_eq!(fx.catalog.sources_disposed(), 1);
    assert_eq!(fx.units.registry().live_sources(), 0);

    let err = fx.units.features("gsml:GeologicUnit", Query::all()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}

#[test]
fn test_invalid_scope_is_rejected() {
    let catalog = catalog();
    let err = MappingScope::load("broken", vec![mf_mapping()], catalog.clone(), vec![], EngineConfig::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(catalog.sources_created(), 0);

    let err = MappingScope::load(
        "missing",
        vec![FeatureTypeMapping::new("ex:X", "X", col("ID"), db("nowhere"))],
        catalog.clone(),
        vec![],
        EngineConfig::default(),
    ).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}
