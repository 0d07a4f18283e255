//! VM construction options.

/// Embedder-supplied configuration, fixed at VM construction.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Binary name of the root class.
    pub object_class_name: String,
    /// Interfaces implemented by every array type, by binary name.
    /// Missing classes are skipped with a debug log, so minimal
    /// embeddings without a full class library still resolve arrays.
    pub array_interfaces: Vec<String>,
    /// Bucket count of the interface method table. Prime sizes spread
    /// the slot hash best.
    pub interface_table_slots: usize,
    /// Binary name of the string class used for string literals.
    pub string_class_name: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            object_class_name: "java/lang/Object".to_string(),
            array_interfaces: vec![
                "java/lang/Cloneable".to_string(),
                "java/io/Serializable".to_string(),
            ],
            interface_table_slots: 31,
            string_class_name: "java/lang/String".to_string(),
        }
    }
}
