//! Recipe engine.
//!
//! A product's recipe is a set of `product_recipes` lines linking it to
//! ingredients with a quantity in the ingredient's unit. Editing a recipe
//! recomputes the product's `cost_price` (sum of `quantity * cost_per_unit`
//! over live lines) and maintains its `has_recipe` flag, all inside the
//! same transaction as the line edit.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, Result};
use crate::money::Money;
use crate::versioning::{new_row_id, BUMP_CLAUSE};

/// One recipe line as returned by [`get_recipe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeLine {
    pub id: String,
    pub ingredient_id: String,
    pub ingredient_name: String,
    pub unit: Option<String>,
    pub quantity: f64,
    pub cost_per_unit: Money,
}

/// Aggregated nutrition for one product, derived from its recipe.
/// Ingredient nutrition fields are per 100 units of the ingredient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductNutrition {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub sugar: f64,
    pub fat: f64,
    pub sodium: f64,
    pub is_gluten_free: bool,
    pub contains_dairy: bool,
    pub contains_nuts: bool,
}

/// Add an ingredient to a product's recipe, or update the quantity of an
/// existing line. Returns the product's recomputed cost price.
pub fn add_ingredient_to_recipe(
    state: &DbState,
    product_id: &str,
    ingredient_id: &str,
    quantity: f64,
) -> Result<Money> {
    if !(quantity > 0.0) {
        return Err(PosError::InvalidArgument(format!(
            "recipe quantity must be positive, got {quantity}"
        )));
    }

    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;
    let mut conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    ensure_exists(&tx, "products", "product", product_id)?;
    ensure_exists(&tx, "ingredients", "ingredient", ingredient_id)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM product_recipes
             WHERE product_id = ?1 AND ingredient_id = ?2 AND deleted_at IS NULL",
            params![product_id, ingredient_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(line_id) => {
            tx.execute(
                &format!("UPDATE product_recipes SET quantity = ?1, {BUMP_CLAUSE} WHERE id = ?2"),
                params![quantity, line_id],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO product_recipes (id, product_id, ingredient_id, quantity)
                 VALUES (?1, ?2, ?3, ?4)",
                params![new_row_id(), product_id, ingredient_id, quantity],
            )?;
        }
    }

    let cost = recalculate_product_cost(&tx, product_id)?;
    tx.commit()?;

    info!(product_id, ingredient_id, quantity, "Recipe line saved");
    Ok(cost)
}

/// Remove an ingredient from a product's recipe (soft delete) and
/// recompute the cost price. Returns the new cost.
pub fn remove_ingredient_from_recipe(
    state: &DbState,
    product_id: &str,
    ingredient_id: &str,
) -> Result<Money> {
    let _gate = state
        .sync_gate
        .lock()
        .map_err(|_| PosError::poisoned_lock())?;
    let mut conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let removed = tx.execute(
        &format!(
            "UPDATE product_recipes
             SET deleted_at = strftime('%Y-%m-%dT%H:%M:%fZ','now'), {BUMP_CLAUSE}
             WHERE product_id = ?1 AND ingredient_id = ?2 AND deleted_at IS NULL"
        ),
        params![product_id, ingredient_id],
    )?;
    if removed == 0 {
        return Err(PosError::NotFound {
            entity: "recipe line",
            id: format!("{product_id}/{ingredient_id}"),
        });
    }

    let cost = recalculate_product_cost(&tx, product_id)?;
    tx.commit()?;

    info!(product_id, ingredient_id, "Recipe line removed");
    Ok(cost)
}

/// Recompute and store a product's cost price from its live recipe lines.
/// Also maintains `has_recipe`. Runs inside the caller's transaction and
/// bumps the product version once.
///
/// Recipe quantities are fractional (grams, millilitres), so each line's
/// cost is rounded to a whole minor unit at aggregation time.
fn recalculate_product_cost(conn: &Connection, product_id: &str) -> Result<Money> {
    let (cost_minor, line_count): (i64, i64) = conn.query_row(
        "SELECT COALESCE(CAST(ROUND(SUM(pr.quantity * i.cost_per_unit)) AS INTEGER), 0),
                COUNT(pr.id)
         FROM product_recipes pr
         JOIN ingredients i ON i.id = pr.ingredient_id AND i.deleted_at IS NULL
         WHERE pr.product_id = ?1 AND pr.deleted_at IS NULL",
        params![product_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    conn.execute(
        &format!("UPDATE products SET cost_price = ?1, has_recipe = ?2, {BUMP_CLAUSE} WHERE id = ?3"),
        params![cost_minor, (line_count > 0) as i64, product_id],
    )?;

    Ok(Money::from_minor(cost_minor))
}

/// The live recipe lines for a product.
pub fn get_recipe(state: &DbState, product_id: &str) -> Result<Vec<RecipeLine>> {
    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    let mut stmt = conn.prepare(
        "SELECT pr.id, i.id, i.name, i.unit, pr.quantity, i.cost_per_unit
         FROM product_recipes pr
         JOIN ingredients i ON i.id = pr.ingredient_id
         WHERE pr.product_id = ?1 AND pr.deleted_at IS NULL
         ORDER BY i.name",
    )?;
    let lines = stmt
        .query_map(params![product_id], |row| {
            Ok(RecipeLine {
                id: row.get(0)?,
                ingredient_id: row.get(1)?,
                ingredient_name: row.get(2)?,
                unit: row.get(3)?,
                quantity: row.get(4)?,
                cost_per_unit: Money::from_minor(row.get(5)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(lines)
}

/// Aggregate nutrition and allergen flags over a product's recipe.
/// Nutrition scales by `quantity / 100`; the product is gluten free only
/// if every ingredient is, and carries dairy/nuts if any ingredient does.
pub fn product_nutrition(state: &DbState, product_id: &str) -> Result<ProductNutrition> {
    let conn = state.conn.lock().map_err(|_| PosError::poisoned_lock())?;
    ensure_exists(&conn, "products", "product", product_id)?;

    conn.query_row(
        "SELECT COALESCE(SUM(pr.quantity * i.calories / 100.0), 0),
                COALESCE(SUM(pr.quantity * i.protein / 100.0), 0),
                COALESCE(SUM(pr.quantity * i.carbs / 100.0), 0),
                COALESCE(SUM(pr.quantity * i.sugar / 100.0), 0),
                COALESCE(SUM(pr.quantity * i.fat / 100.0), 0),
                COALESCE(SUM(pr.quantity * i.sodium / 100.0), 0),
                COALESCE(MIN(i.is_gluten_free), 1),
                COALESCE(MAX(i.contains_dairy), 0),
                COALESCE(MAX(i.contains_nuts), 0)
         FROM product_recipes pr
         JOIN ingredients i ON i.id = pr.ingredient_id AND i.deleted_at IS NULL
         WHERE pr.product_id = ?1 AND pr.deleted_at IS NULL",
        params![product_id],
        |row| {
            Ok(ProductNutrition {
                calories: row.get(0)?,
                protein: row.get(1)?,
                carbs: row.get(2)?,
                sugar: row.get(3)?,
                fat: row.get(4)?,
                sodium: row.get(5)?,
                is_gluten_free: row.get::<_, i64>(6)? != 0,
                contains_dairy: row.get::<_, i64>(7)? != 0,
                contains_nuts: row.get::<_, i64>(8)? != 0,
            })
        },
    )
    .map_err(PosError::from)
}

fn ensure_exists(
    conn: &Connection,
    table: &str,
    entity: &'static str,
    id: &str,
) -> Result<()> {
    let found: bool = conn
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE id = ?1 AND deleted_at IS NULL"),
            params![id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !found {
        return Err(PosError::NotFound {
            entity,
            id: id.to_string(),
        });
    }
    Ok(())
}
