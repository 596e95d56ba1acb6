//! Deterministic sorting and fixed-size pagination.
//!
//! # Invariants
//! - Sorting is stable and total: ties fall back to identity ascending.
//! - `total_pages == ceil(total_elements / size)`, and 0 for an empty result.

use crate::model::entity::Entity;
use crate::query::descriptor::{Direction, SortOrder};
use crate::query::{QueryError, QueryResult};
use std::cmp::Ordering;

/// Zero-based page index, positive size and optional sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: usize,
    size: usize,
    sort: Vec<SortOrder>,
}

impl PageRequest {
    pub fn of(page: usize, size: usize) -> QueryResult<Self> {
        if size == 0 {
            return Err(QueryError::InvalidPageRequest(
                "page size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            page,
            size,
            sort: Vec::new(),
        })
    }

    pub fn sorted(page: usize, size: usize, sort: Vec<SortOrder>) -> QueryResult<Self> {
        Ok(Self::of(page, size)?.with_sort(sort))
    }

    pub fn with_sort(mut self, sort: Vec<SortOrder>) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sort(&self) -> &[SortOrder] {
        &self.sort
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.size)
    }

    /// Request for the following page; `None` once the page index is exhausted.
    pub fn next(&self) -> Option<Self> {
        Some(Self {
            page: self.page.checked_add(1)?,
            size: self.size,
            sort: self.sort.clone(),
        })
    }
}

/// One slice of an ordered result plus totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    content: Vec<T>,
    number: usize,
    size: usize,
    total_elements: usize,
}

impl<T> Page<T> {
    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn total_elements(&self) -> usize {
        self.total_elements
    }

    pub fn total_pages(&self) -> usize {
        self.total_elements.div_ceil(self.size)
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn has_next(&self) -> bool {
        self.number
            .checked_add(1)
            .and_then(|following| following.checked_mul(self.size))
            .is_some_and(|end| end < self.total_elements)
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Maps content while keeping page metadata.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// Slices an already ordered sequence.
pub fn paginate<T>(items: Vec<T>, request: &PageRequest) -> Page<T> {
    let total_elements = items.len();
    let start = request.offset().min(total_elements);
    let end = start.saturating_add(request.size).min(total_elements);
    let content = items.into_iter().skip(start).take(end - start).collect();

    Page {
        content,
        number: request.page,
        size: request.size,
        total_elements,
    }
}

/// Sorts entities by `orders`, breaking ties by identity ascending.
pub fn sort_entities<E: Entity>(items: &mut [E], orders: &[SortOrder]) {
    items.sort_by(|a, b| {
        for order in orders {
            let ordering = compare_attribute(a, b, &order.property);
            let ordering = match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.id().cmp(&b.id())
    });
}

fn compare_attribute<E: Entity>(a: &E, b: &E, property: &str) -> Ordering {
    match (a.attribute(property), b.attribute(property)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => left.cmp(&right),
    }
}

#[cfg(test)]
mod tests {
    use super::{paginate, sort_entities, PageRequest};
    use crate::model::member::Member;
    use crate::query::descriptor::SortOrder;
    use crate::query::QueryError;

    fn member(id: u64, name: &str, age: i64) -> Member {
        let mut member = Member::with_age(name, age);
        member.id = Some(id);
        member
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            PageRequest::of(0, 0),
            Err(QueryError::InvalidPageRequest(_))
        ));
    }

    #[test]
    fn page_metadata_follows_formulas() {
        let request = PageRequest::of(0, 3).unwrap();
        let page = paginate((1..=5).collect::<Vec<_>>(), &request);
        assert_eq!(page.content(), &[1, 2, 3]);
        assert_eq!(page.total_elements(), 5);
        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(page.has_next());

        let last = paginate((1..=5).collect::<Vec<_>>(), &request.next().unwrap());
        assert_eq!(last.content(), &[4, 5]);
        assert!(!last.has_next());
        assert!(last.is_last());
        assert!(last.has_previous());
    }

    #[test]
    fn empty_result_has_zero_pages() {
        let page = paginate(Vec::<u8>::new(), &PageRequest::of(0, 4).unwrap());
        assert_eq!(page.total_pages(), 0);
        assert!(page.is_first());
        assert!(!page.has_next());
    }

    #[test]
    fn out_of_range_page_is_empty() {
        let page = paginate(vec![1, 2], &PageRequest::of(7, 2).unwrap());
        assert!(page.content().is_empty());
        assert_eq!(page.total_pages(), 1);
    }

    #[test]
    fn sort_breaks_ties_by_identity() {
        let mut members = vec![member(3, "c", 10), member(1, "a", 10), member(2, "b", 20)];
        sort_entities(&mut members, &[SortOrder::desc("age")]);
        let ids: Vec<_> = members.iter().map(|m| m.id.unwrap()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn map_keeps_metadata() {
        let page = paginate(vec![1, 2, 3], &PageRequest::of(1, 2).unwrap());
        let mapped = page.map(|n| n * 10);
        assert_eq!(mapped.content(), &[30]);
        assert_eq!(mapped.number(), 1);
        assert_eq!(mapped.total_elements(), 3);
    }

    #[test]
    fn last_addressable_page_does_not_overflow() {
        let request = PageRequest::of(usize::MAX, 2).unwrap();
        assert!(request.next().is_none());

        let page = paginate(vec![1, 2, 3], &request);
        assert!(page.content().is_empty());
        assert!(!page.has_next());
    }

    #[test]
    fn pages_partition_the_ordered_result() {
        let items: Vec<u32> = (1..=11).collect();
        for size in 1..=12 {
            let mut request = PageRequest::of(0, size).unwrap();
            let mut seen = Vec::new();
            loop {
                let page = paginate(items.clone(), &request);
                assert_eq!(page.total_pages(), items.len().div_ceil(size));
                assert_eq!(page.is_first(), page.number() == 0);
                seen.extend_from_slice(page.content());
                if !page.has_next() {
                    break;
                }
                request = request.next().unwrap();
            }
            assert_eq!(seen, items, "size {size}");
        }
    }
}
