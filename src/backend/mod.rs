// =============================================================================
// BACKEND — Sources concrètes branchées sur le moteur
// =============================================================================
//
// Le moteur (module core) ne connaît JAMAIS de base concrète : il consomme
// les traits SourceFactory / TabularSource / Cursor. Chaque backend les
// implémente pour un stockage donné.
//
//   memory → tables en mémoire (tests, démonstration)
//
// Un adaptateur SQL ou fichier plat se brancherait ici de la même façon.
//
// =============================================================================

pub mod memory;

pub use memory::{MemoryCatalog, MemoryTable};
