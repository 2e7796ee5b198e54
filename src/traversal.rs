//! Traversal orderings over the logical tile grid.

/// Total ordering over the tile coordinates of one level.
pub trait Traversal: Send + Sync {
    /// Traversal's name, for diagnostics.
    fn name(&self) -> &str;

    /// Every coordinate of the `nb_tiles_per_dimension` grid, in visit
    /// order. The result has `∏ nb_tiles_per_dimension` entries.
    fn traversal(&self, nb_tiles_per_dimension: &[usize]) -> Vec<Vec<usize>>;
}

/// Lexicographic traversal, last declared dimension varying fastest.
pub struct NaiveTraversal;

impl Traversal for NaiveTraversal {
    fn name(&self) -> &str {
        "Naive Traversal"
    }

    fn traversal(&self, nb_tiles_per_dimension: &[usize]) -> Vec<Vec<usize>> {
        let mut traversal = Vec::with_capacity(nb_tiles_per_dimension.iter().product());
        let mut current = Vec::with_capacity(nb_tiles_per_dimension.len());
        generate(&mut traversal, nb_tiles_per_dimension, &mut current);
        traversal
    }
}

fn generate(traversal: &mut Vec<Vec<usize>>, nb_tiles: &[usize], current: &mut Vec<usize>) {
    let dimension = current.len();
    if dimension == nb_tiles.len() {
        traversal.push(current.clone());
        return;
    }
    for pos in 0..nb_tiles[dimension] {
        current.push(pos);
        generate(traversal, nb_tiles, current);
        current.pop();
    }
}
