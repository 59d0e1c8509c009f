//! # Multimapa de Headers
//! src/http/headers.rs
//!
//! Headers como lista ordenada de `nombre -> [valores]`. La búsqueda es
//! case-insensitive y los headers duplicados se conservan en orden de llegada.

/// Multimapa ordenado de headers HTTP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Agrega un valor sin sobrescribir los existentes
    pub fn append(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => self.entries[i].1.push(value.to_string()),
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// Reemplaza todos los valores de `name` por `value`
    pub fn set(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => self.entries[i].1 = vec![value.to_string()],
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// Agrega texto al último valor de `name` (líneas de continuación)
    ///
    /// Retorna false si el header no existe.
    pub fn extend_last(&mut self, name: &str, text: &str) -> bool {
        match self.position(name).and_then(|i| self.entries[i].1.last_mut()) {
            Some(last) => {
                last.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Primer valor del header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(|s| s.as_str())
    }

    /// Todos los valores del header, en orden de llegada
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// Nombres distintos presentes
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Pares `(nombre, valor)` aplanados
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    /// Número total de valores (cada duplicado cuenta)
    pub fn value_count(&self) -> usize {
        self.entries.iter().map(|(_, vs)| vs.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
