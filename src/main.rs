// =============================================================================
// FEATURECHAIN — Point d'entrée : démonstration du chaînage de features
// =============================================================================
//
// Ce main.rs montre un exemple complet :
//   1. Peupler une source en mémoire (lignes dénormalisées)
//   2. Charger deux scopes de mappings, le second lié au premier
//   3. Lire des features complexes, chaînées par valeur et par référence
//   4. Filtrer sur une propriété d'une feature imbriquée
//
// Traces : RUST_LOG=featurechain=debug cargo run
//
// =============================================================================

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use featurechain::backend::{MemoryCatalog, MemoryTable};
use featurechain::config::EngineConfig;
use featurechain::core::expression::{Expression, Predicate};
use featurechain::core::mapping::{AttributeMapping, FeatureTypeMapping};
use featurechain::core::query::{Query, SortOrder};
use featurechain::core::scope::MappingScope;
use featurechain::core::source::SourceDescriptor;
use featurechain::error::Result;

const MAPPED_FEATURE: &str = "\
_=ID:String,NAME:String,GU_ID:String
mf1=mf1|MERGED BASALT|gu.25699
mf2=mf2|ROCKLEA DOME|gu.25678
mf3=mf3|ROCKLEA DOME 2|gu.25678
mf4=mf4|MURRADUC BASALT|gu.25682
";

const GEOLOGIC_UNIT: &str = "\
_=ID:String,NAME:String,TEXTDESCRIPTION:String,MF_ID:String
gu.25699=gu.25699|Yaugher Volcanic Group|Olivine basalt, tuff, microgabbro|mf1
gu.25678=gu.25678|Yaugher Volcanic Group 1|Olivine basalt, tuff, microgabbro|mf2
gu.25678=gu.25678|Yaugher Volcanic Group 2|Olivine basalt, tuff, microgabbro|mf3
gu.25682=gu.25682|New Automan Sandstone|Medium to coarse grained sandstone|mf4
";

const COMPOSITION_PART: &str = "\
_=ID:String,GU_ID:String,PROPORTION:String
cp.1=cp.1|gu.25699|minor
cp.2=cp.2|gu.25678|significant
cp.3=cp.3|gu.25682|significant
";

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run() {
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    println!("╔══════════════════════════════════════════════════╗");
    println!("║      FEATURECHAIN — Features complexes           ║");
    println!("║      Chaînage par valeur et par référence        ║");
    println!("╚══════════════════════════════════════════════════╝\n");

    // ═══════════════════════════════════════════════════════════
    // ÉTAPE 1 : Les sources tabulaires
    // ═══════════════════════════════════════════════════════════
    println!("═══ ÉTAPE 1 : Sources en mémoire ═══\n");

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_table("mf", "MappedFeature", MemoryTable::from_properties(MAPPED_FEATURE)?);
    catalog.add_table("geo", "GeologicUnit", MemoryTable::from_properties(GEOLOGIC_UNIT)?);
    catalog.add_table("geo", "CompositionPart", MemoryTable::from_properties(COMPOSITION_PART)?);
    println!("  3 tables, 2 bases (mf, geo)\n");

    // ═══════════════════════════════════════════════════════════
    // ÉTAPE 2 : Les mappings
    // ═══════════════════════════════════════════════════════════
    println!("═══ ÉTAPE 2 : Mappings ═══\n");

    let geo = SourceDescriptor::new("memory").param("database", "geo");
    let mut unit = FeatureTypeMapping::new("gsml:GeologicUnit", "GeologicUnit", Expression::column("ID"), geo.clone());
    unit.denormalized(true)
        .map_attr("gml:description", Expression::column("TEXTDESCRIPTION"))
        .map_multi("gml:name", Expression::column("NAME"))
        .add(AttributeMapping::nested(
            "gsml:composition",
            Expression::column("ID"),
            "gsml:CompositionPart",
            Expression::column("GU_ID"),
        ).multiple())
        .add(AttributeMapping::reference(
            "gsml:occurrence",
            Expression::column("MF_ID"),
            "urn:cgi:feature:MappedFeature:{}",
        ).multiple());

    let mut part = FeatureTypeMapping::new("gsml:CompositionPart", "CompositionPart", Expression::column("ID"), geo);
    part.map_attr("gsml:proportion/gsml:CGI_TermValue/gsml:value", Expression::column("PROPORTION"));

    let mut mapped = FeatureTypeMapping::new(
        "gsml:MappedFeature",
        "MappedFeature",
        Expression::column("ID"),
        SourceDescriptor::new("memory").param("database", "mf"),
    );
    mapped.map_attr("gml:name", Expression::column("NAME"))
        .add(AttributeMapping::nested(
            "gsml:specification",
            Expression::column("GU_ID"),
            "gsml:GeologicUnit",
            Expression::column("ID"),
        ));

    println!("{}\n{}\n{}\n", unit, part, mapped);

    let config = EngineConfig::default();
    let units = MappingScope::load("units", vec![unit, part], catalog.clone(), vec![], config.clone())?;
    let features = MappingScope::load("mappedfeature", vec![mapped], catalog.clone(), vec![Arc::clone(&units)], config)?;
    println!("✓ 2 scopes chargés, {} sources ouvertes\n", catalog.sources_created());

    // ═══════════════════════════════════════════════════════════
    // ÉTAPE 3 : Lecture
    // ═══════════════════════════════════════════════════════════
    println!("═══ ÉTAPE 3 : MappedFeature (specification chaînée) ═══\n");

    for feature in features.features("gsml:MappedFeature", Query::all())? {
        println!("{}", feature?);
    }

    // ═══════════════════════════════════════════════════════════
    // ÉTAPE 4 : Filtre sur une propriété imbriquée
    // ═══════════════════════════════════════════════════════════
    println!("═══ ÉTAPE 4 : GeologicUnit où proportion = significant ═══\n");

    let query = Query::filtered(Predicate::equals(
        "gsml:composition/gsml:CompositionPart/gsml:proportion/gsml:CGI_TermValue/gsml:value".to_string(),
        "significant",
    ))
    .sorted_by("gml:description", SortOrder::Ascending);
    println!("  {}\n", query);

    for feature in units.features("gsml:GeologicUnit", query)? {
        println!("{}", feature?);
    }

    features.dispose();
    units.dispose();
    println!("✓ {} sources libérées", catalog.sources_disposed());
    Ok(())
}
